//! Sync progress reporting.
//!
//! Each sync pass reports how many files it has processed out of the total
//! it discovered, labelled by phase. Progress goes to **stderr** so stdout
//! stays parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One progress update: `completed` of `total` files, with a phase label
/// such as `"memory"` or `"sessions"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncProgressEvent {
    pub completed: u64,
    pub total: u64,
    pub label: String,
}

/// Receives sync progress. Implementations write to stderr (human or JSON)
/// or collect events in tests.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync memory  1,234 / 5,000 files".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = format!(
            "sync {}  {} / {} files\n",
            event.label,
            format_number(event.completed),
            format_number(event.total)
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "label": event.label,
            "completed": event.completed,
            "total": event.total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// Shared counter for one sync pass. File workers tick it concurrently.
pub(crate) struct ProgressTracker {
    reporter: Option<Arc<dyn SyncProgressReporter>>,
    completed: AtomicU64,
    total: AtomicU64,
}

impl ProgressTracker {
    pub(crate) fn new(reporter: Option<Arc<dyn SyncProgressReporter>>) -> Self {
        Self {
            reporter,
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_total(&self, n: u64, label: &str) {
        let total = self.total.fetch_add(n, Ordering::SeqCst) + n;
        self.emit(self.completed.load(Ordering::SeqCst), total, label);
    }

    pub(crate) fn tick(&self, label: &str) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(completed, self.total.load(Ordering::SeqCst), label);
    }

    fn emit(&self, completed: u64, total: u64, label: &str) {
        if let Some(reporter) = &self.reporter {
            reporter.report(SyncProgressEvent {
                completed,
                total,
                label: label.to_string(),
            });
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Option<Arc<dyn SyncProgressReporter>> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Arc::new(StderrProgress)),
            ProgressMode::Json => Some(Arc::new(JsonProgress)),
        }
    }
}
