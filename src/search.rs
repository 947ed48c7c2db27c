//! Query path: keyword and vector retrieval, merged into one ranking.
//!
//! Searching never waits on indexing. A dirty index fires a background sync
//! and the query runs against whatever the live database holds.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use memory_index_core::embedding::is_zero_vector;
use memory_index_core::hybrid::{build_fts_query, merge_hybrid_results, Candidate, HybridWeights};
use memory_index_core::models::SearchResult;

use crate::embed;
use crate::manager::MemoryIndexManager;
use crate::sync::SyncReason;

/// Per-call overrides. Unset fields use the `[query]` config.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    /// Calling session; its first search triggers a session-start sync.
    pub session_key: Option<String>,
}

impl MemoryIndexManager {
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<Vec<SearchResult>> {
        self.warm_session(options.session_key.as_deref()).await;
        let config = &self.inner.config;
        if config.sync.on_search && self.is_dirty() {
            self.spawn_sync(SyncReason::Search);
        }

        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let max_results = options.max_results.unwrap_or(config.query.max_results).max(1);
        let min_score = options.min_score.unwrap_or(config.query.min_score);
        let pool = config.candidate_pool(max_results);
        let hybrid = &config.query.hybrid;

        let provider = Arc::clone(&self.inner.active.read().await.provider);
        let query_vec = embed::embed_query(provider.as_ref(), query).await?;

        let store = self.inner.store.read().await;
        let sources = &self.inner.sources;
        let keyword = match (hybrid.enabled && store.fts().available, build_fts_query(query)) {
            (true, Some(fts_query)) => {
                store
                    .keyword_search(&fts_query, provider.model(), sources, pool)
                    .await?
            }
            _ => Vec::new(),
        };
        let vector = if is_zero_vector(&query_vec) {
            Vec::new()
        } else {
            store
                .vector_search(&query_vec, provider.model(), sources, pool)
                .await?
        };
        debug!(
            keyword = keyword.len(),
            vector = vector.len(),
            pool,
            hybrid = hybrid.enabled,
            "search candidates"
        );

        let ranked = if hybrid.enabled {
            merge_hybrid_results(
                &vector,
                &keyword,
                HybridWeights {
                    vector: hybrid.vector_weight,
                    text: hybrid.text_weight,
                },
            )
        } else {
            vector.into_iter().map(vector_only_result).collect()
        };
        Ok(finalize(ranked, min_score, max_results))
    }
}

fn vector_only_result(c: Candidate) -> SearchResult {
    SearchResult {
        path: c.path,
        start_line: c.start_line,
        end_line: c.end_line,
        score: c.raw_score,
        snippet: c.snippet,
        source: c.source,
    }
}

fn finalize(ranked: Vec<SearchResult>, min_score: f64, max_results: usize) -> Vec<SearchResult> {
    ranked
        .into_iter()
        .filter(|r| r.score >= min_score)
        .take(max_results)
        .collect()
}
