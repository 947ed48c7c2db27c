//! Sync engine: brings the index in line with the workspace and
//! transcripts.
//!
//! A sync is either **incremental** (hash-compare each listed file, re-embed
//! the changed ones, sweep files that disappeared) or a **safe reindex**
//! (build a fresh database beside the live one, then swap it in). A safe
//! reindex runs whenever the stored [`IndexMeta`] no longer matches the
//! active provider, model, or chunking, and on `force`.
//!
//! If a sync fails with an embedding error and a fallback provider is
//! configured, the manager switches providers once and runs a forced
//! reindex with it.

use anyhow::{Context, Result};
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use memory_index_core::chunk::chunk_markdown;
use memory_index_core::models::{FileEntry, IndexMeta, MemorySource};

use crate::batch::BatchManager;
use crate::db;
use crate::embed::{embed_chunks, EmbedContext};
use crate::embedding::{BatchOptions, EmbeddingProvider};
use crate::error::{dimension_change, MemoryError};
use crate::files;
use crate::graph;
use crate::manager::{batch_enabled_for, ActiveProvider, ManagerInner};
use crate::progress::{ProgressTracker, SyncProgressReporter};
use crate::sessions;
use crate::status::FallbackSection;
use crate::store::{IndexStore, IndexedChunk};

/// File workers per pass while batch mode is on.
const BATCH_INDEX_CONCURRENCY: usize = 2;
/// File workers per pass for direct embedding.
const DIRECT_INDEX_CONCURRENCY: usize = 4;

/// Why a sync was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Manual,
    Search,
    Watch,
    SessionStart,
    SessionDelta,
    Interval,
    Fallback,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::Manual => "manual",
            SyncReason::Search => "search",
            SyncReason::Watch => "watch",
            SyncReason::SessionStart => "session-start",
            SyncReason::SessionDelta => "session-delta",
            SyncReason::Interval => "interval",
            SyncReason::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct SyncOptions {
    pub reason: SyncReason,
    /// Rebuild everything through a safe reindex.
    pub force: bool,
    pub progress: Option<Arc<dyn SyncProgressReporter>>,
}

impl SyncOptions {
    pub fn new(reason: SyncReason) -> Self {
        Self {
            reason,
            force: false,
            progress: None,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_progress(mut self, progress: Option<Arc<dyn SyncProgressReporter>>) -> Self {
        self.progress = progress;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new(SyncReason::Manual)
    }
}

/// Whether the stored metadata forces a rebuild.
pub fn needs_full_reindex(
    meta: Option<&IndexMeta>,
    expected: &IndexMeta,
    vector_available: bool,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    let Some(meta) = meta else {
        return true;
    };
    meta.model != expected.model
        || meta.provider != expected.provider
        || meta.provider_key != expected.provider_key
        || meta.chunk_tokens != expected.chunk_tokens
        || meta.chunk_overlap != expected.chunk_overlap
        || (vector_available && meta.vector_dims.is_none())
}

/// Whether this pass should touch transcripts.
pub fn should_sync_sessions(
    sessions_enabled: bool,
    reason: SyncReason,
    force: bool,
    full_reindex: bool,
    sessions_dirty: bool,
    dirty_files: usize,
) -> bool {
    if !sessions_enabled {
        return false;
    }
    if force {
        return true;
    }
    if matches!(reason, SyncReason::SessionStart | SyncReason::Watch) {
        return false;
    }
    if full_reindex {
        return true;
    }
    sessions_dirty && dirty_files > 0
}

/// Errors that a different embedding provider might not hit.
pub fn is_embedding_failure(err: &anyhow::Error) -> bool {
    let message = format!("{:#}", err).to_lowercase();
    message.contains("embedding") || message.contains("batch")
}

/// One pass over the sources against a single store.
struct IndexPass<'a> {
    inner: &'a ManagerInner,
    store: &'a IndexStore,
    provider: &'a dyn EmbeddingProvider,
    batch: &'a BatchManager,
    batch_options: BatchOptions,
    concurrency: usize,
    progress: &'a ProgressTracker,
    /// Vector size this pass writes; 0 until the first embedding.
    dims: AtomicUsize,
}

impl<'a> IndexPass<'a> {
    async fn new(
        inner: &'a ManagerInner,
        store: &'a IndexStore,
        provider: &'a dyn EmbeddingProvider,
        batch: &'a BatchManager,
        progress: &'a ProgressTracker,
        known_dims: Option<usize>,
    ) -> IndexPass<'a> {
        let concurrency = if batch.is_enabled().await {
            BATCH_INDEX_CONCURRENCY
        } else {
            DIRECT_INDEX_CONCURRENCY
        };
        IndexPass {
            inner,
            store,
            provider,
            batch,
            batch_options: inner.batch_options(),
            concurrency,
            progress,
            dims: AtomicUsize::new(known_dims.unwrap_or(0)),
        }
    }

    fn dims(&self) -> Option<usize> {
        match self.dims.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    /// Every embedding in one index must share a size.
    fn check_dims(&self, actual: usize) -> Result<()> {
        match self
            .dims
            .compare_exchange(0, actual, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(expected) if expected == actual => Ok(()),
            Err(expected) => Err(MemoryError::DimensionsChanged { expected, actual }.into()),
        }
    }

    async fn index_file(&self, entry: &FileEntry, content: &str) -> Result<()> {
        let chunks: Vec<_> = chunk_markdown(content, self.inner.config.chunking.params())
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .collect();
        let ctx = EmbedContext {
            store: self.store,
            provider: self.provider,
            batch: self.batch,
            batch_options: &self.batch_options,
            cache_enabled: self.inner.config.cache.enabled,
        };
        let embeddings = embed_chunks(&ctx, entry, &chunks)
            .await
            .with_context(|| format!("embedding failed for {}", entry.path))?;
        if let Some(dims) = embeddings.iter().map(Vec::len).find(|&n| n > 0) {
            self.check_dims(dims)?;
            self.store.ensure_vector_table(dims).await?;
        }
        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();
        self.store
            .replace_file(entry, &indexed, self.provider.model())
            .await
    }

    async fn unchanged(&self, entry: &FileEntry) -> Result<bool> {
        Ok(self.store.file_hash(&entry.path, entry.source).await?.as_deref() == Some(entry.hash.as_str()))
    }

    async fn sync_memory(&self) -> Result<()> {
        let workspace = &self.inner.workspace_dir;
        let listed = files::list_memory_files(
            workspace,
            &self.inner.config.extra_paths,
            &self.inner.config.exclude_globs,
        )?;
        self.progress.add_total(listed.len() as u64, "memory");

        let tasks: Vec<_> = listed
            .iter()
            .map(|path| async move {
                let file = files::memory_file_entry(path, workspace).await?;
                if !self.unchanged(&file.entry).await? {
                    self.index_file(&file.entry, &file.content).await?;
                }
                self.progress.tick("memory");
                Ok::<_, anyhow::Error>(())
            }
            .boxed())
            .collect();
        stream::iter(tasks)
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        let live: Vec<String> = listed
            .iter()
            .map(|path| files::relative_path(path, workspace))
            .collect();
        let removed = self.store.remove_stale(MemorySource::Memory, &live).await?;
        if !removed.is_empty() {
            debug!(removed = removed.len(), "swept deleted memory files");
        }
        Ok(())
    }

    /// Index transcripts. With an empty `dirty` set every file is
    /// considered; otherwise only the dirty ones are. Returns the files that
    /// were examined so their pending deltas can be cleared.
    async fn sync_sessions(&self, dirty: &HashSet<PathBuf>) -> Result<Vec<PathBuf>> {
        let listed = sessions::list_session_files(&self.inner.sessions_dir);
        let index_all = dirty.is_empty();
        self.progress.add_total(listed.len() as u64, "sessions");

        let tasks: Vec<_> = listed
            .iter()
            .map(|path| async move {
                if !index_all && !dirty.contains(path) {
                    self.progress.tick("sessions");
                    return Ok::<_, anyhow::Error>(None);
                }
                let file = sessions::build_session_entry(path).await?;
                if !self.unchanged(&file.entry).await? {
                    self.index_file(&file.entry, &file.content).await?;
                }
                self.progress.tick("sessions");
                Ok(Some(path.clone()))
            }
            .boxed())
            .collect();
        let examined: Vec<Option<PathBuf>> = stream::iter(tasks)
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let live: Vec<String> = listed.iter().map(|p| sessions::session_index_path(p)).collect();
        let removed = self.store.remove_stale(MemorySource::Sessions, &live).await?;
        if !removed.is_empty() {
            debug!(removed = removed.len(), "swept deleted transcripts");
        }
        Ok(examined.into_iter().flatten().collect())
    }
}

impl ManagerInner {
    pub(crate) async fn run_sync(&self, options: SyncOptions) -> Result<()> {
        let err = match self.sync_once(&options).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_embedding_failure(&err) {
            return Err(err);
        }
        match self.activate_fallback(&err).await {
            Ok(true) => {
                let forced = SyncOptions {
                    reason: SyncReason::Fallback,
                    force: true,
                    progress: options.progress.clone(),
                };
                match self.sync_once(&forced).await {
                    Ok(()) => Ok(()),
                    Err(fallback_err) => {
                        warn!(error = %format!("{:#}", fallback_err), "fallback reindex failed");
                        Err(err)
                    }
                }
            }
            Ok(false) => Err(err),
            Err(fallback_err) => {
                warn!(error = %format!("{:#}", fallback_err), "fallback provider unavailable");
                Err(err)
            }
        }
    }

    /// Swap to the configured fallback provider. Returns false when there
    /// is none or it is already active.
    async fn activate_fallback(&self, cause: &anyhow::Error) -> Result<bool> {
        let Some(kind) = self.config.embedding.fallback else {
            return Ok(false);
        };
        let mut active = self.active.write().await;
        if active.fallback.is_some() || active.kind == kind {
            return Ok(false);
        }
        let provider = self
            .factory
            .create(kind, &self.config)
            .with_context(|| format!("Failed to create fallback {} provider", kind))?;
        let reason = format!("{:#}", cause);
        warn!(
            from = %active.kind,
            to = %kind,
            model = provider.model(),
            reason = %reason,
            "switching to fallback embedding provider"
        );
        let batch = Arc::new(BatchManager::new(batch_enabled_for(&self.config, provider.as_ref())));
        let from = active.kind.to_string();
        *active = ActiveProvider {
            provider,
            kind,
            batch,
            fallback: Some(FallbackSection { from, reason }),
        };
        Ok(true)
    }

    async fn sync_once(&self, options: &SyncOptions) -> Result<()> {
        let vector_available = self.ensure_vector_ready().await;
        let (provider, batch) = {
            let active = self.active.read().await;
            (Arc::clone(&active.provider), Arc::clone(&active.batch))
        };
        let expected = IndexMeta {
            model: provider.model().to_string(),
            provider: provider.id().to_string(),
            provider_key: provider.provider_key().to_string(),
            chunk_tokens: self.config.chunking.tokens,
            chunk_overlap: self.config.chunking.overlap,
            vector_dims: None,
        };
        let meta = self.store.read().await.read_meta().await?;
        let full = needs_full_reindex(meta.as_ref(), &expected, vector_available, options.force);
        let progress = ProgressTracker::new(options.progress.clone());
        info!(reason = %options.reason, force = options.force, full, "memory sync started");

        match meta {
            Some(meta) if !full => {
                let result = self
                    .run_incremental(options, provider.as_ref(), &batch, &meta, &progress)
                    .await;
                if let Err(e) = result {
                    let Some(dims) = dimension_change(&e) else {
                        return Err(e);
                    };
                    info!(error = %format!("{:#}", e), "vector size changed; rebuilding index");
                    let progress = ProgressTracker::new(options.progress.clone());
                    self.run_safe_reindex(options, provider.as_ref(), &batch, expected, Some(dims), &progress)
                        .await?;
                }
            }
            _ => {
                self.run_safe_reindex(options, provider.as_ref(), &batch, expected, None, &progress)
                    .await?;
            }
        }
        info!(reason = %options.reason, full, "memory sync finished");
        Ok(())
    }

    async fn run_incremental(
        &self,
        options: &SyncOptions,
        provider: &dyn EmbeddingProvider,
        batch: &BatchManager,
        meta: &IndexMeta,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let store = self.store.read().await;
        let pass = IndexPass::new(self, &store, provider, batch, progress, meta.vector_dims).await;

        if self.sources.contains(&MemorySource::Memory)
            && (options.force || self.dirty.load(Ordering::SeqCst))
        {
            self.dirty.store(false, Ordering::SeqCst);
            if let Err(e) = pass.sync_memory().await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        let dirty_files = self.take_session_work(options, false).await;
        if let Some(dirty_files) = dirty_files {
            match pass.sync_sessions(&dirty_files).await {
                Ok(examined) => self.mark_sessions_indexed(&examined).await,
                Err(e) => {
                    self.restore_session_work(dirty_files).await;
                    return Err(e);
                }
            }
        }

        if let (None, Some(dims)) = (meta.vector_dims, pass.dims()) {
            store
                .write_meta(&IndexMeta {
                    vector_dims: Some(dims),
                    ..meta.clone()
                })
                .await?;
        }
        Ok(())
    }

    /// Build a fresh index beside the live one and swap it in. The live
    /// database is untouched unless every step succeeds. `cache_dims`
    /// restricts the seeded cache to vectors of that size.
    async fn run_safe_reindex(
        &self,
        options: &SyncOptions,
        provider: &dyn EmbeddingProvider,
        batch: &BatchManager,
        expected: IndexMeta,
        cache_dims: Option<usize>,
        progress: &ProgressTracker,
    ) -> Result<()> {
        let temp_path = db::temp_index_path(&self.db_path);
        let temp = self
            .open_store(&temp_path)
            .await
            .context("Failed to open temporary index")?;
        info!(temp = %temp_path.display(), reason = %options.reason, "building index from scratch");

        let memory_was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        let session_work = self.take_session_work(options, true).await;

        let built: Result<Vec<PathBuf>> = async {
            if self.config.cache.enabled {
                let seeded = temp.seed_cache_from(&*self.store.read().await, cache_dims).await?;
                debug!(entries = seeded, "seeded embedding cache");
            }
            let pass = IndexPass::new(self, &temp, provider, batch, progress, None).await;
            if self.sources.contains(&MemorySource::Memory) {
                pass.sync_memory().await?;
            }
            let examined = match &session_work {
                Some(_) => pass.sync_sessions(&HashSet::new()).await?,
                None => Vec::new(),
            };
            let meta = IndexMeta {
                vector_dims: pass.dims().or_else(|| temp.vector_dims()),
                ..expected
            };
            temp.write_meta(&meta).await?;
            if let (true, Some(max)) = (self.config.cache.enabled, self.config.cache.max_entries) {
                let pruned = temp.prune_cache(max).await?;
                if pruned > 0 {
                    debug!(pruned, max, "pruned embedding cache");
                }
            }
            Ok(examined)
        }
        .await;

        let examined = match built {
            Ok(examined) => examined,
            Err(e) => {
                self.discard_reindex(&temp, &temp_path, memory_was_dirty, session_work).await;
                return Err(e);
            }
        };

        {
            let mut live = self.store.write().await;
            // Graph writers hold the read lock, so nothing lands after this copy.
            match graph::copy_graph(live.pool(), temp.pool()).await {
                Ok(copied) => debug!(rows = copied, "carried knowledge graph over"),
                Err(e) => {
                    drop(live);
                    self.discard_reindex(&temp, &temp_path, memory_was_dirty, session_work).await;
                    return Err(e);
                }
            }
            temp.close().await;
            live.close().await;
            if let Err(e) = db::swap_index_files(&self.db_path, &temp_path) {
                if let Err(cleanup) = db::remove_index_files(&temp_path) {
                    warn!(error = %format!("{:#}", cleanup), "failed to remove temporary index");
                }
                *live = self
                    .open_store(&self.db_path)
                    .await
                    .context("Failed to reopen index after swap error")?;
                if memory_was_dirty {
                    self.dirty.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
            *live = self
                .open_store(&self.db_path)
                .await
                .context("Failed to reopen index after reindex")?;
        }
        self.mark_sessions_indexed(&examined).await;
        Ok(())
    }

    /// Drop an unfinished temp index and hand back the work it claimed.
    async fn discard_reindex(
        &self,
        temp: &IndexStore,
        temp_path: &Path,
        memory_was_dirty: bool,
        session_work: Option<HashSet<PathBuf>>,
    ) {
        temp.close().await;
        if let Err(cleanup) = db::remove_index_files(temp_path) {
            warn!(error = %format!("{:#}", cleanup), "failed to remove temporary index");
        }
        if memory_was_dirty {
            self.dirty.store(true, Ordering::SeqCst);
        }
        if let Some(work) = session_work {
            self.restore_session_work(work).await;
        }
    }

    /// Claim the dirty transcript set if this pass should sync sessions.
    async fn take_session_work(
        &self,
        options: &SyncOptions,
        full_reindex: bool,
    ) -> Option<HashSet<PathBuf>> {
        let mut state = self.sessions.lock().await;
        let run = should_sync_sessions(
            self.sources.contains(&MemorySource::Sessions),
            options.reason,
            options.force,
            full_reindex,
            self.sessions_dirty.load(Ordering::SeqCst),
            state.dirty_files.len(),
        );
        if !run {
            return None;
        }
        self.sessions_dirty.store(false, Ordering::SeqCst);
        Some(std::mem::take(&mut state.dirty_files))
    }

    async fn restore_session_work(&self, files: HashSet<PathBuf>) {
        if files.is_empty() {
            return;
        }
        let mut state = self.sessions.lock().await;
        state.dirty_files.extend(files);
        self.sessions_dirty.store(true, Ordering::SeqCst);
    }

    async fn mark_sessions_indexed(&self, examined: &[PathBuf]) {
        if examined.is_empty() {
            return;
        }
        let mut state = self.sessions.lock().await;
        for path in examined {
            state.tracker.mark_indexed(path);
        }
    }
}
