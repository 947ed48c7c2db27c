//! Session transcript parsing and append tracking.
//!
//! Transcripts are JSONL files where each line is an event. Only
//! `{"type":"message"}` events from the `user` or `assistant` role are
//! indexed; everything else (tool calls, metadata) is skipped.

use serde_json::Value;
use std::ops::Range;

/// Directory prefix used for transcript paths in the index.
pub const SESSIONS_PATH_PREFIX: &str = "sessions";

/// Logical index path for a transcript file name, e.g. `sessions/abc.jsonl`.
pub fn session_path_for(file_name: &str) -> String {
    format!("{}/{}", SESSIONS_PATH_PREFIX, file_name)
}

/// Flatten a JSONL transcript into `User: …` / `Assistant: …` lines.
///
/// Malformed lines are ignored. Whitespace inside each message is collapsed
/// to single spaces so one message always occupies one line, which keeps
/// chunk line numbers meaningful.
pub fn session_text_from_jsonl(raw: &str) -> String {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if record.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(message) = record.get("message") else {
            continue;
        };
        let label = match message.get("role").and_then(Value::as_str) {
            Some("user") => "User",
            Some("assistant") => "Assistant",
            _ => continue,
        };
        let Some(text) = message.get("content").and_then(extract_text) else {
            continue;
        };
        let text = collapse_whitespace(&text);
        if text.is_empty() {
            continue;
        }
        lines.push(format!("{}: {}", label, text));
    }
    lines.join("\n")
}

fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join(" "))
            }
        }
        _ => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Count `\n` bytes; one transcript line is one event.
pub fn count_newlines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|b| **b == b'\n').count() as u64
}

/// Thresholds a transcript must cross before it is re-indexed.
///
/// A zero threshold means any change counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaThresholds {
    pub bytes: u64,
    pub messages: u64,
}

/// Append tracking for one transcript file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDelta {
    pub last_size: u64,
    pub pending_bytes: u64,
    pub pending_messages: u64,
}

impl SessionDelta {
    /// Record a new file size.
    ///
    /// Returns the byte range whose newlines should be counted as new
    /// messages, or `None` when the size did not change. A shrunken file is
    /// treated as rewritten from scratch.
    pub fn observe_size(&mut self, size: u64) -> Option<Range<u64>> {
        if size == self.last_size {
            return None;
        }
        let range = if size < self.last_size {
            self.pending_bytes += size;
            0..size
        } else {
            self.pending_bytes += size - self.last_size;
            self.last_size..size
        };
        self.last_size = size;
        Some(range)
    }

    pub fn add_messages(&mut self, count: u64) {
        self.pending_messages += count;
    }

    /// Whether accumulated changes are large enough to re-index.
    pub fn crossed(&self, t: DeltaThresholds) -> bool {
        let bytes_hit = if t.bytes == 0 {
            self.pending_bytes > 0
        } else {
            self.pending_bytes >= t.bytes
        };
        let messages_hit = if t.messages == 0 {
            self.pending_messages > 0
        } else {
            self.pending_messages >= t.messages
        };
        bytes_hit || messages_hit
    }

    /// Clear pending counters once the file has been scheduled or indexed.
    pub fn clear_pending(&mut self) {
        self.pending_bytes = 0;
        self.pending_messages = 0;
    }
}
