//! Chunk embedding pipeline.
//!
//! For one file's chunks:
//!
//! 1. Look up every chunk hash in the embedding cache.
//! 2. Embed the misses, through the provider's batch API when batch mode is
//!    on, otherwise in token-bounded direct requests with retry.
//! 3. Write the fresh embeddings back to the cache.
//!
//! The returned vectors line up with the input chunks.

use anyhow::{Context, Result};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use memory_index_core::chunk::hash_text;
use memory_index_core::embedding::group_by_token_budget;
use memory_index_core::models::{FileEntry, MemoryChunk};

use crate::batch::BatchManager;
use crate::embedding::retry::{with_retry, with_timeout};
use crate::embedding::{BatchEmbedder, BatchOptions, BatchRequest, EmbeddingProvider};
use crate::store::{CacheScope, IndexStore};

/// Estimated-token ceiling per direct embedding request.
pub const EMBEDDING_BATCH_MAX_TOKENS: usize = 8_000;

/// Direct requests in flight per file; results keep input order.
const DIRECT_REQUEST_CONCURRENCY: usize = 2;

/// Everything the pipeline needs for one sync run.
pub struct EmbedContext<'a> {
    pub store: &'a IndexStore,
    pub provider: &'a dyn EmbeddingProvider,
    pub batch: &'a BatchManager,
    pub batch_options: &'a BatchOptions,
    pub cache_enabled: bool,
}

impl EmbedContext<'_> {
    fn scope(&self) -> CacheScope {
        CacheScope {
            provider: self.provider.id().to_string(),
            model: self.provider.model().to_string(),
            provider_key: self.provider.provider_key().to_string(),
        }
    }
}

/// Batch request id for a chunk: unique per file position and request slot.
pub fn batch_custom_id(entry: &FileEntry, chunk: &MemoryChunk, index: usize) -> String {
    hash_text(&format!(
        "{}:{}:{}:{}:{}:{}",
        entry.source, entry.path, chunk.start_line, chunk.end_line, chunk.hash, index
    ))
}

/// Embed `chunks` of `entry`, cache first.
pub async fn embed_chunks(
    ctx: &EmbedContext<'_>,
    entry: &FileEntry,
    chunks: &[MemoryChunk],
) -> Result<Vec<Vec<f32>>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    let scope = ctx.scope();
    let cached = if ctx.cache_enabled {
        let unique: Vec<String> = chunks
            .iter()
            .map(|c| c.hash.clone())
            .filter(|h| !h.is_empty())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ctx.store.load_cached(&scope, &unique).await?
    } else {
        HashMap::new()
    };

    let mut embeddings: Vec<Vec<f32>> = vec![Vec::new(); chunks.len()];
    let mut missing: Vec<usize> = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        match cached.get(&chunk.hash) {
            Some(hit) if !hit.is_empty() => embeddings[i] = hit.clone(),
            _ => missing.push(i),
        }
    }
    if missing.is_empty() {
        debug!(path = %entry.path, chunks = chunks.len(), "all embeddings cached");
        return Ok(embeddings);
    }

    let missing_chunks: Vec<&MemoryChunk> = missing.iter().map(|&i| &chunks[i]).collect();
    let fresh = match ctx.provider.batch_api() {
        Some(api) if ctx.batch.is_enabled().await => {
            ctx.batch
                .run_with_fallback(
                    ctx.provider.id(),
                    || embed_with_batch_api(api, ctx.batch_options, entry, &missing_chunks),
                    || embed_direct(ctx.provider, &missing_chunks),
                )
                .await?
        }
        _ => embed_direct(ctx.provider, &missing_chunks).await?,
    };

    let mut to_cache = Vec::with_capacity(missing.len());
    for (slot, embedding) in missing.iter().zip(fresh) {
        if !embedding.is_empty() {
            to_cache.push((chunks[*slot].hash.clone(), embedding.clone()));
        }
        embeddings[*slot] = embedding;
    }
    if ctx.cache_enabled {
        ctx.store.upsert_cached(&scope, &to_cache).await?;
    }
    debug!(
        path = %entry.path,
        cached = chunks.len() - missing.len(),
        embedded = missing.len(),
        "embedded chunks"
    );
    Ok(embeddings)
}

/// Direct requests grouped under the token budget, each retried and
/// bounded by the provider's batch timeout.
async fn embed_direct(
    provider: &dyn EmbeddingProvider,
    chunks: &[&MemoryChunk],
) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let timeout = provider.class().batch_timeout();
    let groups: Vec<Vec<String>> = group_by_token_budget(&texts, EMBEDDING_BATCH_MAX_TOKENS)
        .into_iter()
        .map(|group| group.iter().map(|&i| texts[i].to_string()).collect())
        .collect();
    let requests: Vec<_> = groups
        .iter()
        .map(|batch| async move {
            let vectors = with_retry("embed batch", || {
                with_timeout("embedding batch", timeout, provider.embed_batch(batch))
            })
            .await?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "{} returned {} embeddings for {} texts",
                    provider.id(),
                    vectors.len(),
                    batch.len()
                );
            }
            Ok::<_, anyhow::Error>(vectors)
        }
        .boxed())
        .collect();
    let results: Vec<Vec<Vec<f32>>> = stream::iter(requests)
        .buffered(DIRECT_REQUEST_CONCURRENCY)
        .try_collect()
        .await?;
    Ok(results.into_iter().flatten().collect())
}

async fn embed_with_batch_api(
    api: &dyn BatchEmbedder,
    options: &BatchOptions,
    entry: &FileEntry,
    chunks: &[&MemoryChunk],
) -> Result<Vec<Vec<f32>>> {
    let requests: Vec<BatchRequest> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| BatchRequest {
            custom_id: batch_custom_id(entry, chunk, i),
            text: chunk.text.clone(),
        })
        .collect();
    let mut by_id = api.run_batch(&requests, options).await?;
    requests
        .iter()
        .map(|r| {
            by_id
                .remove(&r.custom_id)
                .with_context(|| format!("batch output is missing request {}", r.custom_id))
        })
        .collect()
}

/// Embed a search query, bounded by the provider's query timeout.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let timeout = provider.class().query_timeout();
    debug!(provider = provider.id(), timeout_secs = timeout.as_secs(), "embedding query");
    with_timeout("query embedding", timeout, provider.embed_query(text)).await
}
