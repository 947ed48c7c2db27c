//! The memory index manager.
//!
//! [`MemoryIndexManager`] owns one agent's index: the SQLite store, the
//! active embedding provider, batch state, dirty tracking, and the
//! background task that turns file and transcript changes into syncs. It is
//! a cheap `Clone` handle; all clones share state.
//!
//! The sync engine lives in [`crate::sync`] and the query path in
//! [`crate::search`]; both are implemented on the shared inner state.

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use memory_index_core::models::MemorySource;

use crate::batch::BatchManager;
use crate::config::{Config, ProviderKind};
use crate::db;
use crate::embed;
use crate::embedding::{BatchOptions, EmbeddingProvider, ProviderFactory};
use crate::files::{self, ReadFileRequest, ReadFileResult};
use crate::graph::{GraphEntity, KnowledgeGraph, NewEntity, NewRelation, WholeGraph};
use crate::sessions::{SessionDeltaTracker, SessionTranscriptBus};
use crate::status::{
    BatchSection, CacheSection, FallbackSection, FtsSection, MemoryStatus, VectorSection,
};
use crate::store::IndexStore;
use crate::sync::{SyncOptions, SyncReason};

/// Upper bound on loading the vector extension.
pub const VECTOR_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

type SharedSync = Shared<BoxFuture<'static, Result<(), Arc<anyhow::Error>>>>;

/// Outcome of the one-time vector extension load.
#[derive(Debug, Clone, Default)]
pub(crate) struct VectorLoad {
    pub(crate) available: bool,
    pub(crate) error: Option<String>,
}

pub(crate) struct VectorState {
    pub(crate) enabled: bool,
    pub(crate) extension_path: Option<PathBuf>,
    pub(crate) load: OnceCell<VectorLoad>,
}

/// The provider currently used for embedding, and what it replaced.
pub(crate) struct ActiveProvider {
    pub(crate) provider: Arc<dyn EmbeddingProvider>,
    pub(crate) kind: ProviderKind,
    pub(crate) batch: Arc<BatchManager>,
    pub(crate) fallback: Option<FallbackSection>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) tracker: SessionDeltaTracker,
    pub(crate) dirty_files: HashSet<PathBuf>,
    pub(crate) warmed: HashSet<String>,
}

pub(crate) struct ManagerInner {
    pub(crate) config: Config,
    pub(crate) workspace_dir: PathBuf,
    pub(crate) db_path: PathBuf,
    pub(crate) sessions_dir: PathBuf,
    pub(crate) sources: Vec<MemorySource>,
    pub(crate) factory: Arc<dyn ProviderFactory>,
    pub(crate) active: RwLock<ActiveProvider>,
    pub(crate) store: RwLock<IndexStore>,
    pub(crate) vector: VectorState,
    pub(crate) dirty: AtomicBool,
    pub(crate) sessions_dirty: AtomicBool,
    pub(crate) sessions: tokio::sync::Mutex<SessionState>,
    pub(crate) closed: AtomicBool,
    sync_slot: Mutex<Option<SharedSync>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one agent's memory index.
#[derive(Clone)]
pub struct MemoryIndexManager {
    pub(crate) inner: Arc<ManagerInner>,
}

/// Batch mode applies only to providers that expose a batch API.
pub(crate) fn batch_enabled_for(config: &Config, provider: &dyn EmbeddingProvider) -> bool {
    config.embedding.remote.batch.enabled && provider.batch_api().is_some()
}

async fn load_vector_extension(enabled: bool, extension: Option<&Path>, db_path: &Path) -> VectorLoad {
    if !enabled {
        return VectorLoad::default();
    }
    let Some(ext) = extension else {
        return VectorLoad {
            available: false,
            error: Some("no vector extension configured; using in-process cosine scan".into()),
        };
    };
    match tokio::time::timeout(VECTOR_LOAD_TIMEOUT, db::probe_vector_extension(db_path, ext)).await {
        Ok(Ok(version)) => {
            info!(extension = %ext.display(), version = %version, "vector extension loaded");
            VectorLoad {
                available: true,
                error: None,
            }
        }
        Ok(Err(e)) => {
            warn!(error = %format!("{:#}", e), "vector extension unavailable");
            VectorLoad {
                available: false,
                error: Some(format!("{:#}", e)),
            }
        }
        Err(_) => {
            warn!("vector extension load timed out");
            VectorLoad {
                available: false,
                error: Some(format!(
                    "vector extension load timed out after {}s",
                    VECTOR_LOAD_TIMEOUT.as_secs()
                )),
            }
        }
    }
}

impl ManagerInner {
    pub(crate) fn batch_options(&self) -> BatchOptions {
        let b = &self.config.embedding.remote.batch;
        BatchOptions {
            wait: b.wait,
            concurrency: b.concurrency.max(1),
            poll_interval: Duration::from_millis(b.poll_interval_ms.max(1)),
            timeout: Duration::from_secs(b.timeout_minutes.max(1) * 60),
        }
    }

    /// Load the vector extension once; concurrent callers share the attempt.
    pub(crate) async fn ensure_vector_ready(&self) -> bool {
        self.vector
            .load
            .get_or_init(|| {
                load_vector_extension(
                    self.vector.enabled,
                    self.vector.extension_path.as_deref(),
                    &self.db_path,
                )
            })
            .await
            .available
    }

    /// Extension path to hand to new store connections, if loaded.
    pub(crate) fn loaded_extension(&self) -> Option<&Path> {
        match self.vector.load.get() {
            Some(load) if load.available => self.vector.extension_path.as_deref(),
            _ => None,
        }
    }

    pub(crate) async fn open_store(&self, path: &Path) -> Result<IndexStore> {
        IndexStore::open(path, self.config.query.hybrid.enabled, self.loaded_extension()).await
    }

    fn clear_sync_slot(&self) {
        if let Ok(mut slot) = self.sync_slot.lock() {
            *slot = None;
        }
    }
}

impl MemoryIndexManager {
    /// Open the index for `config`, creating the database if needed.
    ///
    /// No background work starts until [`MemoryIndexManager::start_background`].
    pub async fn open(config: Config, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        config.validate()?;
        let kind = config.embedding.provider;
        let provider = factory
            .create(kind, &config)
            .with_context(|| format!("Failed to create {} embedding provider", kind))?;
        let batch = Arc::new(BatchManager::new(batch_enabled_for(&config, provider.as_ref())));

        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Probe before opening so the store's connections load the
        // extension only when it is usable.
        let extension_path = config.store.vector.extension_path.clone();
        let load = load_vector_extension(
            config.store.vector.enabled,
            extension_path.as_deref(),
            &db_path,
        )
        .await;
        let store_ext = if load.available {
            extension_path.as_deref()
        } else {
            None
        };
        let store = IndexStore::open(&db_path, config.query.hybrid.enabled, store_ext).await?;
        let vector = VectorState {
            enabled: config.store.vector.enabled,
            extension_path,
            load: OnceCell::new_with(Some(load)),
        };
        let sessions = SessionState {
            tracker: SessionDeltaTracker::new(config.sync.sessions.thresholds()),
            dirty_files: HashSet::new(),
            warmed: HashSet::new(),
        };

        let inner = ManagerInner {
            workspace_dir: config.workspace_dir(),
            sessions_dir: config.sessions_dir(),
            sources: config.sources.clone(),
            dirty: AtomicBool::new(config.has_source(MemorySource::Memory)),
            sessions_dirty: AtomicBool::new(false),
            sessions: tokio::sync::Mutex::new(sessions),
            closed: AtomicBool::new(false),
            sync_slot: Mutex::new(None),
            background: Mutex::new(None),
            active: RwLock::new(ActiveProvider {
                provider,
                kind,
                batch,
                fallback: None,
            }),
            store: RwLock::new(store),
            vector,
            db_path,
            factory,
            config,
        };

        info!(
            agent = %inner.config.agent_id,
            db = %inner.db_path.display(),
            provider = %kind,
            "memory index opened"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst) || self.inner.sessions_dirty.load(Ordering::SeqCst)
    }

    /// Flag memory files as changed; the next sync re-scans them.
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    /// Run a sync, or join the one already in flight.
    pub async fn sync(&self, options: SyncOptions) -> Result<()> {
        let fut = {
            let mut slot = self
                .inner
                .sync_slot
                .lock()
                .map_err(|_| anyhow::anyhow!("sync slot lock poisoned"))?;
            match slot.as_ref() {
                Some(existing) => {
                    debug!(reason = %options.reason, "joining in-flight sync");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fut: SharedSync = async move {
                        let result = inner.run_sync(options).await.map_err(Arc::new);
                        inner.clear_sync_slot();
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
            .map_err(|e| Arc::try_unwrap(e).unwrap_or_else(|shared| anyhow::anyhow!("{:#}", shared)))
    }

    /// Fire a sync without waiting; failures are logged.
    pub(crate) fn spawn_sync(&self, reason: SyncReason) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.sync(SyncOptions::new(reason)).await {
                warn!(reason = %reason, error = %format!("{:#}", e), "memory sync failed");
            }
        });
    }

    /// Sync once per session key when a session starts.
    pub(crate) async fn warm_session(&self, session_key: Option<&str>) {
        if !self.inner.config.sync.on_session_start {
            return;
        }
        let key = session_key.map(str::trim).unwrap_or_default();
        if !key.is_empty() {
            let mut sessions = self.inner.sessions.lock().await;
            if !sessions.warmed.insert(key.to_string()) {
                return;
            }
        }
        self.spawn_sync(SyncReason::SessionStart);
    }

    /// Read a memory file (or a line window of it) from the workspace.
    pub fn read_file(&self, request: &ReadFileRequest) -> Result<ReadFileResult> {
        files::read_memory_file(
            &self.inner.workspace_dir,
            &self.inner.config.extra_paths,
            request,
        )
    }

    // ============ Knowledge graph ============

    /// Insert or update a graph entity. Returns its id.
    pub async fn add_entity(&self, entity: &NewEntity) -> Result<String> {
        let store = self.inner.store.read().await;
        KnowledgeGraph::new(store.pool()).add_entity(entity).await
    }

    pub async fn add_relation(&self, relation: &NewRelation) -> Result<()> {
        let store = self.inner.store.read().await;
        KnowledgeGraph::new(store.pool()).add_relation(relation).await
    }

    pub async fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<GraphEntity>> {
        let store = self.inner.store.read().await;
        KnowledgeGraph::new(store.pool()).search_entities(query, limit).await
    }

    /// Prompt-ready description of the named entities and their neighbours.
    pub async fn graph_context(&self, names: &[String]) -> Result<String> {
        let store = self.inner.store.read().await;
        KnowledgeGraph::new(store.pool()).graph_context(names).await
    }

    pub async fn whole_graph(&self) -> Result<WholeGraph> {
        let store = self.inner.store.read().await;
        KnowledgeGraph::new(store.pool()).whole_graph().await
    }

    /// Whether the vector extension is usable, and why not.
    pub async fn probe_vector_availability(&self) -> (bool, Option<String>) {
        let available = self.inner.ensure_vector_ready().await;
        let error = self.inner.vector.load.get().and_then(|l| l.error.clone());
        (available, error)
    }

    /// Embed a probe string with the active provider.
    pub async fn probe_embedding_availability(&self) -> Result<()> {
        let provider = Arc::clone(&self.inner.active.read().await.provider);
        embed::embed_query(provider.as_ref(), "test").await.map(|_| ())
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        let inner = &self.inner;
        let (provider_id, model, batch, fallback) = {
            let active = inner.active.read().await;
            (
                active.provider.id().to_string(),
                active.provider.model().to_string(),
                active.batch.status().await,
                active.fallback.clone(),
            )
        };
        let store = inner.store.read().await;
        let counts = store.counts(&inner.sources).await?;
        let cache_entries = store.cache_entries().await?;
        let vector_load = inner.vector.load.get().cloned().unwrap_or_default();

        Ok(MemoryStatus {
            agent_id: inner.config.agent_id.clone(),
            workspace_dir: inner.workspace_dir.clone(),
            db_path: inner.db_path.clone(),
            provider: provider_id,
            requested_provider: inner.config.embedding.provider.to_string(),
            model,
            sources: inner.sources.clone(),
            files: counts.files,
            chunks: counts.chunks,
            source_counts: counts.by_source,
            dirty: self.is_dirty(),
            vector: VectorSection {
                enabled: inner.vector.enabled,
                available: vector_load.available,
                dims: store.vector_dims(),
                load_error: vector_load.error,
                extension_path: inner.vector.extension_path.clone(),
            },
            fts: FtsSection {
                enabled: inner.config.query.hybrid.enabled,
                available: store.fts().available,
                error: store.fts().error.clone(),
            },
            cache: CacheSection {
                enabled: inner.config.cache.enabled,
                max_entries: inner.config.cache.max_entries,
                entries: cache_entries,
            },
            batch: BatchSection {
                enabled: batch.enabled,
                failures: batch.failures,
                limit: batch.limit,
                last_error: batch.last_error,
            },
            fallback,
        })
    }

    /// Start watchers, the transcript listener, and the interval timer.
    /// Idempotent.
    pub fn start_background(&self, bus: Option<&SessionTranscriptBus>) -> Result<()> {
        let mut slot = self
            .inner
            .background
            .lock()
            .map_err(|_| anyhow::anyhow!("background lock poisoned"))?;
        if slot.is_some() || self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        *slot = crate::watcher::spawn_background(self.clone(), bus.map(|b| b.subscribe()))?;
        Ok(())
    }

    /// Stop background work and close the database.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.inner.background.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.store.read().await.close().await;
        info!(agent = %self.inner.config.agent_id, "memory index closed");
    }
}
