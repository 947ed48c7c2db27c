//! Line-oriented markdown chunker.
//!
//! Splits file content into [`MemoryChunk`]s bounded by an approximate
//! token budget, with a configurable overlap carried between neighbours so
//! context is not lost at chunk boundaries.
//!
//! # Algorithm
//!
//! 1. Convert `tokens` to `max_chars` using a 4 chars/token ratio
//!    (never below 32), and `overlap` to `overlap_chars` the same way.
//! 2. Walk the content line by line. Lines longer than `max_chars` are cut
//!    into segments of at most `max_chars` characters.
//! 3. Each segment costs its length plus one (the newline).
//! 4. When the next segment would overflow a non-empty buffer, flush the
//!    buffer as a chunk, then keep its trailing lines (at least
//!    `overlap_chars` worth) as the start of the next buffer.
//! 5. Flush whatever is left at the end.
//!
//! Lengths are counted in characters, so multi-byte text is never split in
//! the middle of a code point.
//!
//! # Example
//!
//! ```rust
//! use memory_index_core::chunk::{chunk_markdown, ChunkingParams};
//!
//! let chunks = chunk_markdown("# Notes\nalpha\nbeta", ChunkingParams { tokens: 400, overlap: 80 });
//! assert_eq!(chunks.len(), 1);
//! assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 3));
//! ```

use sha2::{Digest, Sha256};

use crate::models::MemoryChunk;

/// Approximate characters-per-token ratio used for chunk sizing.
pub const CHARS_PER_TOKEN: usize = 4;

/// Lower bound on the chunk size in characters.
const MIN_CHUNK_CHARS: usize = 32;

/// Chunk sizing in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub tokens: usize,
    pub overlap: usize,
}

struct LineEntry {
    text: String,
    line_no: usize,
    chars: usize,
}

/// Split `content` into overlapping, line-aligned chunks.
///
/// Always returns at least one chunk for non-empty input. Chunks whose text
/// is blank are returned as-is; callers drop them before embedding.
pub fn chunk_markdown(content: &str, params: ChunkingParams) -> Vec<MemoryChunk> {
    let max_chars = (params.tokens * CHARS_PER_TOKEN).max(MIN_CHUNK_CHARS);
    let overlap_chars = params.overlap * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut current: Vec<LineEntry> = Vec::new();
    let mut current_chars = 0usize;

    for (i, line) in content.split('\n').enumerate() {
        let line_no = i + 1;
        for segment in split_line(line, max_chars) {
            let seg_chars = segment.chars().count() + 1;
            if current_chars + seg_chars > max_chars && !current.is_empty() {
                chunks.push(flush(&current));
                current_chars = carry_overlap(&mut current, overlap_chars);
            }
            current.push(LineEntry {
                text: segment,
                line_no,
                chars: seg_chars,
            });
            current_chars += seg_chars;
        }
    }

    if !current.is_empty() {
        chunks.push(flush(&current));
    }

    chunks
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_line(line: &str, max_chars: usize) -> Vec<String> {
    if line.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = line.chars().collect();
    chars
        .chunks(max_chars)
        .map(|piece| piece.iter().collect())
        .collect()
}

fn flush(current: &[LineEntry]) -> MemoryChunk {
    let text = current
        .iter()
        .map(|e| e.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    // Both ends exist: callers only flush a non-empty buffer.
    let start_line = current.first().map(|e| e.line_no).unwrap_or(1);
    let end_line = current.last().map(|e| e.line_no).unwrap_or(start_line);
    let hash = hash_text(&text);
    MemoryChunk {
        start_line,
        end_line,
        text,
        hash,
    }
}

/// Keep the trailing entries worth at least `overlap_chars`. Returns the
/// character count of what was kept.
fn carry_overlap(current: &mut Vec<LineEntry>, overlap_chars: usize) -> usize {
    if overlap_chars == 0 {
        current.clear();
        return 0;
    }
    let mut acc = 0usize;
    let mut keep_from = current.len();
    while keep_from > 0 {
        keep_from -= 1;
        acc += current[keep_from].chars;
        if acc >= overlap_chars {
            break;
        }
    }
    current.drain(..keep_from);
    acc
}
