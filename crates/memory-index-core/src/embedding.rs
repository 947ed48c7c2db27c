//! Vector utilities shared by the store and the embedding pipeline.
//!
//! Provider implementations live in the `memory-index` app crate; this
//! module only holds pure helpers: BLOB encoding, cosine similarity, the
//! all-zero check used to skip vector search, and token-bounded grouping
//! of texts for batched embedding requests.

/// Characters per token assumed when sizing embedding requests.
///
/// Deliberately pessimistic (1:1) so a group never exceeds the provider's
/// input limit even for dense text.
pub const EMBEDDING_CHARS_PER_TOKEN: usize = 1;

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use memory_index_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`]. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm operand.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// True when every component is zero (or the vector is empty).
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

/// Rough token estimate for an embedding input.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(EMBEDDING_CHARS_PER_TOKEN)
}

/// Group texts into request batches whose estimated token total stays
/// within `max_tokens`.
///
/// Returns index groups into `texts`, preserving order. A single text that
/// alone exceeds the budget becomes its own group.
pub fn group_by_token_budget(texts: &[&str], max_tokens: usize) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_tokens = 0usize;

    for (i, text) in texts.iter().enumerate() {
        let estimate = estimate_tokens(text);
        let would_overflow = !current.is_empty() && current_tokens + estimate > max_tokens;
        if would_overflow {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if current.is_empty() && estimate > max_tokens {
            groups.push(vec![i]);
            continue;
        }
        current.push(i);
        current_tokens += estimate;
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
