//! Session transcripts: discovery, entries, append tracking, and the
//! update bus transcript writers publish to.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tracing::debug;

use memory_index_core::chunk::hash_text;
use memory_index_core::models::{FileEntry, MemorySource};
use memory_index_core::transcript::{
    count_newlines, session_path_for, session_text_from_jsonl, DeltaThresholds, SessionDelta,
};

use crate::files::{mtime_ms, SourceFile};

const NEWLINE_READ_CHUNK: usize = 64 * 1024;

/// Every `*.jsonl` regular file directly under `dir`, sorted. A missing
/// directory yields an empty list.
pub fn list_session_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = read
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect();
    files.sort();
    files
}

/// Index path for a transcript, e.g. `sessions/abc.jsonl`.
pub fn session_index_path(abs_path: &Path) -> String {
    let name = abs_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    session_path_for(&name)
}

/// Load a transcript for chunking. The hash covers the extracted text, so
/// appending tool events that produce no text does not trigger re-embedding.
pub async fn build_session_entry(abs_path: &Path) -> Result<SourceFile> {
    let meta = tokio::fs::metadata(abs_path)
        .await
        .with_context(|| format!("Failed to stat {}", abs_path.display()))?;
    let raw = tokio::fs::read(abs_path)
        .await
        .with_context(|| format!("Failed to read {}", abs_path.display()))?;
    let content = session_text_from_jsonl(&String::from_utf8_lossy(&raw));
    Ok(SourceFile {
        entry: FileEntry {
            path: session_index_path(abs_path),
            abs_path: abs_path.to_path_buf(),
            source: MemorySource::Sessions,
            hash: hash_text(&content),
            mtime_ms: mtime_ms(&meta),
            size: meta.len(),
        },
        content,
    })
}

/// If `file` lives directly inside `sessions_dir` (compared after
/// resolving symlinks), its path as [`list_session_files`] spells it.
/// Tracking and dirty sets key on that form whatever path a writer
/// published.
pub fn session_file_in(sessions_dir: &Path, file: &Path) -> Option<PathBuf> {
    let parent = file.parent()?;
    let name = file.file_name()?;
    let dir = std::fs::canonicalize(sessions_dir).unwrap_or_else(|_| sessions_dir.to_path_buf());
    let parent = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
    (parent == dir).then(|| sessions_dir.join(name))
}

async fn count_newlines_in_range(path: &Path, start: u64, end: u64) -> Result<u64> {
    if end <= start {
        return Ok(0);
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut remaining = end - start;
    let mut buf = vec![0u8; NEWLINE_READ_CHUNK];
    let mut count = 0;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        count += count_newlines(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(count)
}

/// Per-file append accounting that decides when a transcript has changed
/// enough to re-index.
#[derive(Debug)]
pub struct SessionDeltaTracker {
    thresholds: DeltaThresholds,
    deltas: HashMap<PathBuf, SessionDelta>,
}

impl SessionDeltaTracker {
    pub fn new(thresholds: DeltaThresholds) -> Self {
        Self {
            thresholds,
            deltas: HashMap::new(),
        }
    }

    /// Account for the file's current size. Returns true when the pending
    /// change crosses a threshold; pending counters are then cleared.
    pub async fn observe(&mut self, path: &Path) -> Result<bool> {
        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(_) => return Ok(false),
        };
        let thresholds = self.thresholds;
        let delta = self.deltas.entry(path.to_path_buf()).or_default();
        if let Some(range) = delta.observe_size(size) {
            // Counting newlines is only needed while bytes alone have not
            // decided the outcome.
            let count_messages = thresholds.messages > 0
                && (thresholds.bytes == 0 || delta.pending_bytes < thresholds.bytes);
            if count_messages {
                let lines = count_newlines_in_range(path, range.start, range.end).await?;
                delta.add_messages(lines);
            }
        }
        let hit = delta.crossed(thresholds);
        if hit {
            debug!(
                file = %path.display(),
                pending_bytes = delta.pending_bytes,
                pending_messages = delta.pending_messages,
                "session delta crossed threshold"
            );
            delta.clear_pending();
        }
        Ok(hit)
    }

    /// Forget pending changes once the file has been indexed.
    pub fn mark_indexed(&mut self, path: &Path) {
        if let Some(delta) = self.deltas.get_mut(path) {
            delta.clear_pending();
        }
    }

    #[cfg(test)]
    fn pending(&self, path: &Path) -> Option<&SessionDelta> {
        self.deltas.get(path)
    }
}

/// Notification that a transcript file was appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTranscriptUpdate {
    pub session_file: PathBuf,
}

/// Broadcast channel transcript writers publish to; each manager
/// subscribes and filters to its own sessions directory.
#[derive(Debug, Clone)]
pub struct SessionTranscriptBus {
    sender: broadcast::Sender<SessionTranscriptUpdate>,
}

impl Default for SessionTranscriptBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionTranscriptBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an update. Having no subscribers is not an error.
    pub fn publish(&self, session_file: impl Into<PathBuf>) {
        let _ = self.sender.send(SessionTranscriptUpdate {
            session_file: session_file.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionTranscriptUpdate> {
        self.sender.subscribe()
    }
}
