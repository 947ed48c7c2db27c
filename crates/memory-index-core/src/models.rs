//! Core data models for the memory index.
//!
//! These types describe what flows between the file listers, the chunker,
//! the store, and the search coordinator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical origin of an indexed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// Markdown notes in the workspace (`MEMORY.md`, `memory/**/*.md`).
    Memory,
    /// JSONL chat transcripts under the agent's sessions directory.
    Sessions,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Memory => "memory",
            MemorySource::Sessions => "sessions",
        }
    }
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemorySource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(MemorySource::Memory),
            "sessions" => Ok(MemorySource::Sessions),
            other => anyhow::bail!("Unknown memory source: '{}'. Use memory or sessions.", other),
        }
    }
}

/// One file as seen by a sync pass.
///
/// `hash` is computed from content only, so rewriting a file with identical
/// bytes is recognized as unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Path relative to the workspace (forward slashes), or
    /// `sessions/<name>.jsonl` for transcripts.
    pub path: String,
    /// Absolute path on disk.
    pub abs_path: std::path::PathBuf,
    pub source: MemorySource,
    /// SHA-256 hex of the indexed content.
    pub hash: String,
    pub mtime_ms: i64,
    pub size: u64,
}

/// A contiguous line range of a file. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChunk {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// SHA-256 hex of `text`; the embedding cache key.
    pub hash: String,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub score: f64,
    pub snippet: String,
    pub source: MemorySource,
}

/// Parameters the current index was built with.
///
/// Any mismatch with the live settings forces a full reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_dims: Option<usize>,
}
