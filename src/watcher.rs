//! Background change detection for one manager.
//!
//! A single spawned task owns every event source: the debounced file
//! watcher over the memory files, the transcript bus, and the interval
//! timer. It marks the index dirty and fires syncs; it never blocks on one.

use anyhow::Result;
use notify_debouncer_full::{
    new_debouncer, notify::EventKind, notify::RecommendedWatcher, notify::RecursiveMode,
    DebounceEventResult, Debouncer, RecommendedCache,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use memory_index_core::models::MemorySource;

use crate::manager::MemoryIndexManager;
use crate::sessions::{session_file_in, SessionTranscriptUpdate};
use crate::sync::SyncReason;

/// Transcript updates are batched for this long before deltas are checked.
pub const SESSION_DELTA_DEBOUNCE: Duration = Duration::from_secs(5);

/// A markdown path the watcher saw change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(p) | WatchEvent::Modified(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Debounced watcher over memory files. Dropping it stops watching.
pub struct MemoryFileWatcher {
    debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    /// Targets that did not exist at startup, armed once they appear.
    awaiting: Vec<(PathBuf, RecursiveMode)>,
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

impl MemoryFileWatcher {
    /// Watch `targets` and forward markdown changes to the returned channel.
    /// Missing targets are reported as `Created` when they appear so the
    /// caller can [`arm`](Self::arm) them.
    pub fn start(
        targets: &[(PathBuf, RecursiveMode)],
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let awaiting: Vec<(PathBuf, RecursiveMode)> = targets
            .iter()
            .filter(|(path, _)| !path.exists())
            .cloned()
            .collect();
        let awaited_paths: Vec<PathBuf> = awaiting.iter().map(|(p, _)| p.clone()).collect();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        for path in &event.paths {
                            let is_markdown = path.extension().and_then(|e| e.to_str()) == Some("md");
                            let is_awaited = matches!(event.kind, EventKind::Create(_))
                                && awaited_paths.iter().any(|p| same_path(p, path));
                            if !is_markdown && !is_awaited {
                                continue;
                            }
                            let watch_event = match event.kind {
                                EventKind::Create(_) => WatchEvent::Created(path.clone()),
                                EventKind::Modify(_) => WatchEvent::Modified(path.clone()),
                                EventKind::Remove(_) => WatchEvent::Removed(path.clone()),
                                _ => continue,
                            };
                            debug!(path = %path.display(), "memory file changed");
                            if tx.send(watch_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "file watcher error");
                    }
                }
            }
        })?;

        for (path, mode) in targets {
            if path.exists() {
                debouncer.watch(path, *mode)?;
                info!(path = %path.display(), recursive = matches!(mode, RecursiveMode::Recursive), "watching");
            }
        }

        Ok((Self { debouncer, awaiting }, rx))
    }

    /// Start watching `path` if it is a target that was missing at startup
    /// and now exists. Returns whether a new watch was added.
    pub fn arm(&mut self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let Some(index) = self.awaiting.iter().position(|(p, _)| same_path(p, path)) else {
            return Ok(false);
        };
        let (target, mode) = self.awaiting.remove(index);
        if let Err(e) = self.debouncer.watch(&target, mode) {
            self.awaiting.push((target, mode));
            return Err(e.into());
        }
        info!(path = %target.display(), "watching newly created target");
        Ok(true)
    }
}

/// What to watch for a workspace: its root (for `MEMORY.md`), `memory/`,
/// and each extra path.
pub fn watch_targets(workspace: &Path, extra_paths: &[PathBuf]) -> Vec<(PathBuf, RecursiveMode)> {
    let mut targets = vec![
        (workspace.to_path_buf(), RecursiveMode::NonRecursive),
        (workspace.join("memory"), RecursiveMode::Recursive),
    ];
    for extra in extra_paths {
        let path = if extra.is_absolute() {
            extra.clone()
        } else {
            workspace.join(extra)
        };
        let mode = if path.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        targets.push((path, mode));
    }
    targets
}

/// Whether a changed path can affect the memory index. Markdown directly in
/// the workspace root only counts when it is `MEMORY.md` or `memory.md`.
pub fn is_memory_change(workspace: &Path, path: &Path) -> bool {
    if path.parent() == Some(workspace) {
        return matches!(
            path.file_name().and_then(|n| n.to_str()),
            Some("MEMORY.md") | Some("memory.md")
        );
    }
    true
}

/// Start the background task for `manager`, or `None` when nothing is
/// configured to run.
pub(crate) fn spawn_background(
    manager: MemoryIndexManager,
    bus: Option<broadcast::Receiver<SessionTranscriptUpdate>>,
) -> Result<Option<JoinHandle<()>>> {
    let config = manager.config();
    let watch = if config.sync.watch && config.has_source(MemorySource::Memory) {
        let targets = watch_targets(&config.workspace_dir(), &config.extra_paths);
        let (watcher, rx) = MemoryFileWatcher::start(
            &targets,
            Duration::from_millis(config.sync.watch_debounce_ms),
        )?;
        Some((watcher, rx))
    } else {
        None
    };
    let bus = bus.filter(|_| config.has_source(MemorySource::Sessions));
    let interval = (config.sync.interval_minutes > 0)
        .then(|| Duration::from_secs(config.sync.interval_minutes * 60));

    if watch.is_none() && bus.is_none() && interval.is_none() {
        return Ok(None);
    }
    let (watcher, watch_rx) = match watch {
        Some((w, rx)) => (Some(w), Some(rx)),
        None => (None, None),
    };
    Ok(Some(tokio::spawn(run_background(
        manager, watcher, watch_rx, bus, interval,
    ))))
}

async fn run_background(
    manager: MemoryIndexManager,
    mut watcher: Option<MemoryFileWatcher>,
    mut watch_rx: Option<mpsc::UnboundedReceiver<WatchEvent>>,
    mut bus: Option<broadcast::Receiver<SessionTranscriptUpdate>>,
    interval: Option<Duration>,
) {
    let workspace = manager.config().workspace_dir();
    let sessions_dir = manager.config().sessions_dir();
    let watch_debounce = Duration::from_millis(manager.config().sync.watch_debounce_ms);
    let mut ticker = interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let mut watch_deadline: Option<Instant> = None;
    let mut session_deadline: Option<Instant> = None;
    let mut pending_sessions: HashSet<PathBuf> = HashSet::new();

    loop {
        tokio::select! {
            event = recv_watch(&mut watch_rx) => match event {
                Some(event) => {
                    if affects_index(watcher.as_mut(), &workspace, &event) {
                        manager.mark_dirty();
                        watch_deadline = Some(Instant::now() + watch_debounce);
                    }
                }
                None => watch_rx = None,
            },
            update = recv_bus(&mut bus) => match update {
                Ok(update) => {
                    if let Some(file) = session_file_in(&sessions_dir, &update.session_file) {
                        pending_sessions.insert(file);
                        session_deadline.get_or_insert_with(|| Instant::now() + SESSION_DELTA_DEBOUNCE);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transcript updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => bus = None,
            },
            _ = sleep_until(watch_deadline) => {
                watch_deadline = None;
                manager.spawn_sync(SyncReason::Watch);
            }
            _ = sleep_until(session_deadline) => {
                session_deadline = None;
                let batch: Vec<PathBuf> = pending_sessions.drain().collect();
                if manager.record_session_deltas(batch).await {
                    manager.spawn_sync(SyncReason::SessionDelta);
                }
            }
            _ = tick(&mut ticker) => {
                manager.spawn_sync(SyncReason::Interval);
            }
        }
    }
}

/// Arm a target that just appeared, or filter a markdown change. A new
/// target may already hold notes written before it was armed, so it counts
/// as a change too.
fn affects_index(watcher: Option<&mut MemoryFileWatcher>, workspace: &Path, event: &WatchEvent) -> bool {
    if let (Some(watcher), WatchEvent::Created(path)) = (watcher, event) {
        match watcher.arm(path) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "failed to watch new target"),
        }
    }
    is_memory_change(workspace, event.path())
}

async fn recv_watch(rx: &mut Option<mpsc::UnboundedReceiver<WatchEvent>>) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_bus(
    rx: &mut Option<broadcast::Receiver<SessionTranscriptUpdate>>,
) -> Result<SessionTranscriptUpdate, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl MemoryIndexManager {
    /// Feed changed transcripts through the delta tracker. Returns true when
    /// at least one crossed a threshold and was marked dirty.
    pub(crate) async fn record_session_deltas(&self, files: Vec<PathBuf>) -> bool {
        if files.is_empty() {
            return false;
        }
        let mut state = self.inner.sessions.lock().await;
        let mut hit = false;
        for path in files {
            match state.tracker.observe(&path).await {
                Ok(true) => {
                    state.dirty_files.insert(path);
                    hit = true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(file = %path.display(), error = %format!("{:#}", e), "failed to measure transcript delta")
                }
            }
        }
        if hit {
            self.inner
                .sessions_dirty
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
        hit
    }
}
