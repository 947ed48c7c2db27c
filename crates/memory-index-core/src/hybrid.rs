//! Hybrid score merging and FTS query construction.
//!
//! The store returns two candidate pools for a query: vector candidates
//! scored by cosine similarity and keyword candidates scored by FTS5 rank.
//! This module turns both into one ranked list.
//!
//! # Scoring
//!
//! 1. Vector scores are cosine similarity clamped to `[0, 1]`.
//! 2. Keyword scores are the bm25 rank relative to the best keyword match,
//!    so the top match scores `1.0` and every other match stays above `0`.
//! 3. `score = vector_weight × vector + text_weight × text`. A candidate
//!    missing from one pool contributes `0` for that term.
//! 4. Sort by score (desc), then path and start line for stable output.

use std::collections::HashMap;

use crate::models::{MemorySource, SearchResult};

/// Maximum snippet length in characters.
pub const SNIPPET_MAX_CHARS: usize = 700;

/// A chunk returned by one retrieval strategy, before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub source: MemorySource,
    pub snippet: String,
    /// Strategy-specific score; higher is better.
    pub raw_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    pub vector: f64,
    pub text: f64,
}

/// Build an FTS5 `MATCH` expression from free text.
///
/// Every run of alphanumerics/underscores becomes a quoted term; terms are
/// joined with `AND`. Returns `None` when the query has no usable terms.
///
/// ```rust
/// use memory_index_core::hybrid::build_fts_query;
///
/// assert_eq!(build_fts_query("deploy, k8s!").as_deref(), Some("\"deploy\" AND \"k8s\""));
/// assert_eq!(build_fts_query("?!"), None);
/// ```
pub fn build_fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" AND "))
    }
}

/// Truncate a snippet to [`SNIPPET_MAX_CHARS`] characters.
pub fn truncate_snippet(text: &str) -> String {
    match text.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Clamp a cosine similarity into a `[0, 1]` relevance score.
pub fn vector_score(similarity: f32) -> f64 {
    (similarity as f64).clamp(0.0, 1.0)
}

/// Keyword scores relative to the best match in the pool, keyed by
/// candidate id.
///
/// `raw_score` is the negated FTS5 `bm25()` rank, so every real match is
/// positive and the best one scores `1.0`. Weaker matches keep a
/// proportional, non-zero score. A pool with no positive rank scores `1.0`
/// throughout.
pub fn keyword_scores(candidates: &[Candidate]) -> HashMap<&str, f64> {
    let best = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let score = if best > 0.0 {
                (c.raw_score / best).clamp(0.0, 1.0)
            } else {
                1.0
            };
            (c.id.as_str(), score)
        })
        .collect()
}

/// Merge vector and keyword pools into one ranked list.
///
/// Vector candidates carry their clamped cosine score in `raw_score`;
/// keyword candidates carry a rank-derived score that is scaled here.
/// Keyword snippets win over vector snippets for the same chunk since they
/// are centred on the match.
pub fn merge_hybrid_results(
    vector: &[Candidate],
    keyword: &[Candidate],
    weights: HybridWeights,
) -> Vec<SearchResult> {
    struct Merged<'a> {
        cand: &'a Candidate,
        snippet: &'a str,
        vector: f64,
        text: f64,
    }

    let text_scores = keyword_scores(keyword);
    let mut by_id: HashMap<&str, Merged<'_>> = HashMap::new();

    for c in vector {
        by_id.entry(c.id.as_str()).or_insert(Merged {
            cand: c,
            snippet: &c.snippet,
            vector: c.raw_score.clamp(0.0, 1.0),
            text: 0.0,
        });
    }

    for c in keyword {
        let text = text_scores.get(c.id.as_str()).copied().unwrap_or(0.0);
        let entry = by_id.entry(c.id.as_str()).or_insert(Merged {
            cand: c,
            snippet: &c.snippet,
            vector: 0.0,
            text: 0.0,
        });
        entry.text = text;
        if !c.snippet.is_empty() {
            entry.snippet = c.snippet.as_str();
        }
    }

    let mut results: Vec<SearchResult> = by_id
        .into_values()
        .map(|m| SearchResult {
            path: m.cand.path.clone(),
            start_line: m.cand.start_line,
            end_line: m.cand.end_line,
            score: weights.vector * m.vector + weights.text * m.text,
            snippet: truncate_snippet(m.snippet),
            source: m.cand.source,
        })
        .collect();

    sort_results(&mut results);
    results
}

/// Sort by score (desc), then path and start line.
pub fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
}
