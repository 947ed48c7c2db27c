//! End-to-end tests for the manager: sync, reindex safety, search, and the
//! registry, driven through the public API with a deterministic in-process
//! embedding provider.

use anyhow::Result;
use async_trait::async_trait;
use memory_index::config::{Config, ProviderKind};
use memory_index::embedding::{EmbeddingProvider, ProviderClass, ProviderFactory};
use memory_index::files::ReadFileRequest;
use memory_index::graph::{NewEntity, NewRelation};
use memory_index::progress::{SyncProgressEvent, SyncProgressReporter};
use memory_index::sessions::SessionTranscriptBus;
use memory_index::{
    ManagerRegistry, MemoryIndexManager, SearchOptions, SyncOptions, SyncReason,
};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─── Mock provider ──────────────────────────────────────────────────

const DIMS: usize = 64;

/// Bag-of-words embedding: each token bumps one of `dims` buckets.
fn embed_text(text: &str, dims: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let h = token
            .to_lowercase()
            .bytes()
            .fold(7u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
        v[(h % dims as u64) as usize] += 1.0;
    }
    v
}

#[derive(Default)]
struct MockState {
    embedded: AtomicUsize,
    failing: Mutex<HashSet<ProviderKind>>,
    delay_ms: AtomicUsize,
    /// Vector size override; `0` means `DIMS`.
    dims: AtomicUsize,
}

impl MockState {
    fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    fn dims(&self) -> usize {
        match self.dims.load(Ordering::SeqCst) {
            0 => DIMS,
            n => n,
        }
    }

    fn fail(&self, kind: ProviderKind) {
        self.failing.lock().unwrap().insert(kind);
    }
}

struct MockProvider {
    kind: ProviderKind,
    id: String,
    model: String,
    key: String,
    state: Arc<MockState>,
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider_key(&self) -> &str {
        &self.key
    }

    fn class(&self) -> ProviderClass {
        ProviderClass::Local
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(embed_text(text, self.state.dims()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.state.failing.lock().unwrap().contains(&self.kind) {
            anyhow::bail!("{} API error 401: invalid key", self.id);
        }
        self.state.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        let dims = self.state.dims();
        Ok(texts.iter().map(|t| embed_text(t, dims)).collect())
    }
}

struct MockFactory {
    state: Arc<MockState>,
}

impl ProviderFactory for MockFactory {
    fn create(&self, kind: ProviderKind, config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
        let model = config.model_for(kind);
        Ok(Arc::new(MockProvider {
            kind,
            id: kind.as_str().to_string(),
            key: format!("{}:{}", kind, model),
            model,
            state: Arc::clone(&self.state),
        }))
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Fixture {
    root: TempDir,
    state: Arc<MockState>,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("ws/memory")).unwrap();
        std::fs::create_dir_all(root.path().join("sessions")).unwrap();
        std::fs::write(
            root.path().join("ws/MEMORY.md"),
            "# Memory\n\nThe staging cluster runs kubernetes on three nodes.\n",
        )
        .unwrap();
        std::fs::write(
            root.path().join("ws/memory/2024-05-01.md"),
            "# Notes\n\nAlice prefers tea over coffee in the morning.\n",
        )
        .unwrap();
        Self {
            root,
            state: Arc::new(MockState::default()),
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.agent_id = "test".into();
        config.workspace = self.path().join("ws");
        config.sessions_dir = Some(self.path().join("sessions"));
        config.store.path = Some(self.path().join("db").join("index.sqlite"));
        config.store.vector.enabled = false;
        config.sync.watch = false;
        config.sync.on_session_start = false;
        config.embedding.model = Some("mock-1".into());
        config.query.min_score = 0.0;
        config
    }

    fn factory(&self) -> Arc<dyn ProviderFactory> {
        Arc::new(MockFactory {
            state: Arc::clone(&self.state),
        })
    }

    async fn open(&self, config: Config) -> MemoryIndexManager {
        MemoryIndexManager::open(config, self.factory()).await.unwrap()
    }

    fn temp_files_left(&self) -> Vec<String> {
        std::fs::read_dir(self.path().join("db"))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.contains(".tmp-") || n.contains(".backup-"))
            .collect()
    }
}

async fn search_paths(manager: &MemoryIndexManager, query: &str) -> Vec<String> {
    manager
        .search(query, SearchOptions::default())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect()
}

/// Paths of results whose snippet actually contains `word`.
async fn paths_mentioning(manager: &MemoryIndexManager, word: &str) -> Vec<String> {
    let word = word.to_lowercase();
    manager
        .search(&word, SearchOptions::default())
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.snippet.to_lowercase().contains(&word))
        .map(|r| r.path)
        .collect()
}

/// Poll until `word` shows up in `path`, for at most `attempts * every`.
async fn wait_for_mention(
    manager: &MemoryIndexManager,
    word: &str,
    path: &str,
    attempts: usize,
    every: Duration,
) -> bool {
    for _ in 0..attempts {
        if paths_mentioning(manager, word).await.iter().any(|p| p == path) {
            return true;
        }
        tokio::time::sleep(every).await;
    }
    false
}

#[derive(Default)]
struct CollectProgress(Mutex<Vec<SyncProgressEvent>>);

impl SyncProgressReporter for CollectProgress {
    fn report(&self, event: SyncProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

// ─── Sync ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_is_idempotent() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    assert!(manager.is_dirty());

    manager.sync(SyncOptions::default()).await.unwrap();
    let first = manager.status().await.unwrap();
    assert_eq!(first.files, 2);
    assert!(first.chunks >= 2);
    assert!(!manager.is_dirty());
    let embedded = fx.state.embedded();
    assert!(embedded > 0);

    manager.mark_dirty();
    manager.sync(SyncOptions::default()).await.unwrap();
    let second = manager.status().await.unwrap();
    assert_eq!((second.files, second.chunks), (first.files, first.chunks));
    assert_eq!(fx.state.embedded(), embedded, "unchanged files must not be re-embedded");
    manager.close().await;
}

#[tokio::test]
async fn test_forced_reindex_reuses_cache() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    let before = manager.status().await.unwrap();
    let embedded = fx.state.embedded();

    manager
        .sync(SyncOptions::new(SyncReason::Manual).force(true))
        .await
        .unwrap();
    let after = manager.status().await.unwrap();
    assert_eq!(fx.state.embedded(), embedded);
    assert_eq!((after.files, after.chunks), (before.files, before.chunks));
    assert!(after.cache.entries >= before.chunks);
    assert!(fx.temp_files_left().is_empty());
    manager.close().await;
}

#[tokio::test]
async fn test_failed_reindex_leaves_live_index_intact() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    let before = manager.status().await.unwrap();

    std::fs::write(
        fx.path().join("ws/memory/new.md"),
        "# New\n\nA fresh note that needs embedding.\n",
    )
    .unwrap();
    fx.state.fail(ProviderKind::Openai);

    let err = manager
        .sync(SyncOptions::new(SyncReason::Manual).force(true))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("401"));

    let after = manager.status().await.unwrap();
    assert_eq!((after.files, after.chunks), (before.files, before.chunks));
    assert!(fx.temp_files_left().is_empty(), "temp index must be removed");
    assert_eq!(paths_mentioning(&manager, "kubernetes").await, vec!["MEMORY.md".to_string()]);
    manager.close().await;
}

#[tokio::test]
async fn test_model_change_rebuilds_index() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    let before = manager.status().await.unwrap();
    let embedded = fx.state.embedded();
    manager.close().await;

    let mut config = fx.config();
    config.embedding.model = Some("mock-2".into());
    let manager = fx.open(config).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    let after = manager.status().await.unwrap();

    assert_eq!(after.model, "mock-2");
    assert!(fx.state.embedded() > embedded, "new model must re-embed");
    assert_eq!((after.files, after.chunks), (before.files, before.chunks));
    assert_eq!(paths_mentioning(&manager, "kubernetes").await, vec!["MEMORY.md".to_string()]);
    manager.close().await;
}

#[tokio::test]
async fn test_vector_size_change_rebuilds_index() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    let before = manager.status().await.unwrap();
    let embedded = fx.state.embedded();

    // Same model, but the provider now answers with shorter vectors.
    fx.state.dims.store(DIMS / 2, Ordering::SeqCst);
    std::fs::write(
        fx.path().join("ws/memory/ferry.md"),
        "# Travel\n\nThe ferry to the island leaves at noon.\n",
    )
    .unwrap();
    manager.mark_dirty();
    manager.sync(SyncOptions::default()).await.unwrap();

    let after = manager.status().await.unwrap();
    assert_eq!(after.files, before.files + 1);
    // Cached vectors of the old size cannot be reused.
    assert!(fx.state.embedded() - embedded >= after.chunks as usize);
    assert!(fx.temp_files_left().is_empty());
    assert_eq!(paths_mentioning(&manager, "kubernetes").await, vec!["MEMORY.md".to_string()]);
    assert_eq!(paths_mentioning(&manager, "ferry").await, vec!["memory/ferry.md".to_string()]);

    manager.mark_dirty();
    let settled = fx.state.embedded();
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(fx.state.embedded(), settled, "rebuilt index must be stable");
    manager.close().await;
}

#[tokio::test]
async fn test_non_utf8_note_is_indexed_lossily() {
    let fx = Fixture::new();
    std::fs::write(fx.path().join("ws/memory/latin1.md"), b"caf\xe9 quokka sightings\n").unwrap();
    let manager = fx.open(fx.config()).await;

    manager.sync(SyncOptions::default()).await.unwrap();
    let status = manager.status().await.unwrap();
    assert_eq!(status.files, 3);
    assert_eq!(paths_mentioning(&manager, "quokka").await, vec!["memory/latin1.md".to_string()]);

    // The unchanged file hashes the same on the next pass.
    let embedded = fx.state.embedded();
    manager.mark_dirty();
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(fx.state.embedded(), embedded);
    manager.close().await;
}

#[tokio::test]
async fn test_deleted_file_is_swept() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();

    std::fs::remove_file(fx.path().join("ws/memory/2024-05-01.md")).unwrap();
    manager.mark_dirty();
    manager.sync(SyncOptions::default()).await.unwrap();

    let status = manager.status().await.unwrap();
    assert_eq!(status.files, 1);
    assert!(!search_paths(&manager, "coffee").await.iter().any(|p| p.contains("2024-05-01")));
    manager.close().await;
}

#[tokio::test]
async fn test_concurrent_syncs_share_one_pass() {
    let fx = Fixture::new();
    fx.state.delay_ms.store(50, Ordering::SeqCst);
    let manager = fx.open(fx.config()).await;

    let first = Arc::new(CollectProgress::default());
    let second = Arc::new(CollectProgress::default());
    let (a, b) = tokio::join!(
        manager.sync(SyncOptions::default().with_progress(Some(first.clone()))),
        manager.sync(SyncOptions::default().with_progress(Some(second.clone()))),
    );
    a.unwrap();
    b.unwrap();

    assert!(!first.0.lock().unwrap().is_empty());
    assert!(second.0.lock().unwrap().is_empty(), "second caller joins the first pass");
    let last = first.0.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.completed, last.total);
    manager.close().await;
}

#[tokio::test]
async fn test_fallback_provider_takes_over() {
    let fx = Fixture::new();
    fx.state.fail(ProviderKind::Openai);
    let mut config = fx.config();
    config.embedding.fallback = Some(ProviderKind::Local);
    let manager = fx.open(config).await;

    manager.sync(SyncOptions::default()).await.unwrap();
    let status = manager.status().await.unwrap();
    assert_eq!(status.provider, "local");
    assert_eq!(status.requested_provider, "openai");
    let fallback = status.fallback.expect("fallback recorded");
    assert_eq!(fallback.from, "openai");
    assert!(fallback.reason.contains("401"));
    assert_eq!(status.files, 2);
    manager.close().await;
}

// ─── Search ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_search_finds_relevant_note() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();

    let results = manager
        .search("kubernetes cluster", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].path, "MEMORY.md");
    assert!(results[0].snippet.contains("kubernetes"));
    assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));

    assert!(manager.search("   ", SearchOptions::default()).await.unwrap().is_empty());
    manager.close().await;
}

#[tokio::test]
async fn test_keyword_only_weighting() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.query.hybrid.vector_weight = 0.0;
    config.query.hybrid.text_weight = 1.0;
    config.query.min_score = 0.5;
    let manager = fx.open(config).await;
    manager.sync(SyncOptions::default()).await.unwrap();

    let results = manager.search("tea", SearchOptions::default()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/2024-05-01.md");
    assert!((results[0].score - 1.0).abs() < 1e-9);
    manager.close().await;
}

#[tokio::test]
async fn test_hybrid_weights_flip_ranking() {
    let fx = Fixture::new();
    std::fs::write(
        fx.path().join("ws/memory/keyword.md"),
        "rollback rollback rollback rollback rollback rollback rollback rollback \
         apple apple apple apple apple apple apple apple apple apple\n",
    )
    .unwrap();
    std::fs::write(fx.path().join("ws/memory/semantic.md"), "rollback procedure\n").unwrap();
    // keyword.md: higher term frequency, diluted vector. semantic.md: the reverse.
    let query = "rollback";

    let mut semantic = fx.config();
    semantic.query.hybrid.vector_weight = 1.0;
    semantic.query.hybrid.text_weight = 0.0;
    let manager = fx.open(semantic).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(search_paths(&manager, query).await[0], "memory/semantic.md");
    manager.close().await;

    let mut lexical = fx.config();
    lexical.query.hybrid.vector_weight = 0.0;
    lexical.query.hybrid.text_weight = 1.0;
    let manager = fx.open(lexical).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(search_paths(&manager, query).await[0], "memory/keyword.md");
    manager.close().await;
}

#[tokio::test]
async fn test_vector_only_when_hybrid_disabled() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.query.hybrid.enabled = false;
    let manager = fx.open(config).await;
    manager.sync(SyncOptions::default()).await.unwrap();

    let status = manager.status().await.unwrap();
    assert!(!status.fts.enabled);

    let results = manager
        .search(
            "tea coffee morning",
            SearchOptions {
                max_results: Some(1),
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/2024-05-01.md");
    manager.close().await;
}

#[tokio::test]
async fn test_search_on_dirty_index_triggers_sync() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    assert!(!manager.is_dirty());

    std::fs::write(
        fx.path().join("ws/memory/zebra.md"),
        "# Zoo\n\nThe zebra enclosure moved to the north field.\n",
    )
    .unwrap();
    manager.mark_dirty();
    assert!(manager.is_dirty());

    let mut found = false;
    for _ in 0..50 {
        if search_paths(&manager, "zebra").await.contains(&"memory/zebra.md".to_string()) {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(found, "background sync should index the new note");
    assert!(!manager.is_dirty());
    manager.close().await;
}

// ─── Files ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_file_is_confined_to_workspace() {
    let fx = Fixture::new();
    std::fs::write(fx.path().join("outside.md"), "secret").unwrap();
    let manager = fx.open(fx.config()).await;

    let window = manager
        .read_file(&ReadFileRequest {
            rel_path: "memory/2024-05-01.md".into(),
            from: Some(3),
            lines: Some(1),
        })
        .unwrap();
    assert_eq!(window.text, "Alice prefers tea over coffee in the morning.");
    assert_eq!(window.path, "memory/2024-05-01.md");

    for bad in ["../outside.md", "/etc/passwd", "memory/missing.md", ""] {
        let req = ReadFileRequest {
            rel_path: bad.into(),
            from: None,
            lines: None,
        };
        assert!(manager.read_file(&req).is_err(), "{bad} must be rejected");
    }
    manager.close().await;
}

// ─── Sessions ───────────────────────────────────────────────────────

fn append_message(path: &Path, role: &str, text: &str) {
    let line = serde_json::json!({
        "type": "message",
        "message": { "role": role, "content": text },
    });
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(f, "{}", line).unwrap();
}

fn session_config(fx: &Fixture, sessions_dir: PathBuf) -> Config {
    let mut config = fx.config();
    config.sessions_dir = Some(sessions_dir);
    config.sources = vec![
        memory_index_core::models::MemorySource::Memory,
        memory_index_core::models::MemorySource::Sessions,
    ];
    config.sync.sessions.delta_bytes = 0;
    config.sync.sessions.delta_messages = 0;
    config
}

#[tokio::test]
async fn test_transcripts_are_indexed_and_follow_updates() {
    let fx = Fixture::new();
    let transcript = fx.path().join("sessions/s1.jsonl");
    append_message(&transcript, "user", "Where is the deploy runbook?");
    append_message(&transcript, "assistant", "It lives in the ops wiki.");

    let bus = SessionTranscriptBus::default();
    let registry = ManagerRegistry::new(fx.factory()).with_bus(bus.clone());
    let manager = registry
        .get(session_config(&fx, fx.path().join("sessions")))
        .await
        .unwrap();
    manager.sync(SyncOptions::default()).await.unwrap();

    let status = manager.status().await.unwrap();
    assert_eq!(status.files, 3);
    assert_eq!(paths_mentioning(&manager, "runbook").await, vec!["sessions/s1.jsonl".to_string()]);
    assert!(paths_mentioning(&manager, "walrus").await.is_empty());

    append_message(&transcript, "user", "Also the walrus exhibit needs a new filter.");
    bus.publish(transcript.clone());

    assert!(
        wait_for_mention(&manager, "walrus", "sessions/s1.jsonl", 40, Duration::from_millis(500)).await,
        "transcript delta should trigger a session sync"
    );
    registry.close_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_transcript_update_through_symlinked_sessions_dir() {
    let fx = Fixture::new();
    let link = fx.path().join("sessions-link");
    std::os::unix::fs::symlink(fx.path().join("sessions"), &link).unwrap();
    let real_transcript = fx.path().join("sessions/s1.jsonl");
    append_message(&real_transcript, "user", "Where is the deploy runbook?");

    let bus = SessionTranscriptBus::default();
    let registry = ManagerRegistry::new(fx.factory()).with_bus(bus.clone());
    let manager = registry.get(session_config(&fx, link)).await.unwrap();
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(paths_mentioning(&manager, "runbook").await, vec!["sessions/s1.jsonl".to_string()]);

    // The writer publishes the resolved path, not the configured one.
    append_message(&real_transcript, "assistant", "The walrus exhibit runbook is in the wiki.");
    bus.publish(real_transcript.clone());

    assert!(
        wait_for_mention(&manager, "walrus", "sessions/s1.jsonl", 40, Duration::from_millis(500)).await,
        "update published under the resolved path should still sync"
    );
    registry.close_all().await;
}

// ─── Watching ───────────────────────────────────────────────────────

fn watch_config(fx: &Fixture) -> Config {
    let mut config = fx.config();
    config.sync.watch = true;
    config.sync.watch_debounce_ms = 300;
    // Only the watcher may bring new notes in.
    config.sync.on_search = false;
    config
}

/// Poll the dirty flag until `path` is searchable. Returns whether the flag
/// was seen set along the way, and whether the note showed up at all.
async fn watch_until_indexed(manager: &MemoryIndexManager, word: &str, path: &str) -> (bool, bool) {
    let mut saw_dirty = false;
    for _ in 0..1_000 {
        saw_dirty |= manager.is_dirty();
        if paths_mentioning(manager, word).await.iter().any(|p| p == path) {
            return (saw_dirty, true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (saw_dirty, false)
}

#[tokio::test]
async fn test_watcher_marks_dirty_and_indexes_new_note() {
    let fx = Fixture::new();
    let manager = fx.open(watch_config(&fx)).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    manager.start_background(None).unwrap();
    assert!(!manager.is_dirty());
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(
        fx.path().join("ws/memory/zebra.md"),
        "# Zoo\n\nThe zebra enclosure moved to the north field.\n",
    )
    .unwrap();

    let (saw_dirty, indexed) = watch_until_indexed(&manager, "zebra", "memory/zebra.md").await;
    assert!(indexed, "watch sync should index the new note");
    assert!(saw_dirty, "the watcher should mark the index dirty first");
    assert!(!manager.is_dirty());
    manager.close().await;
}

#[tokio::test]
async fn test_watcher_picks_up_memory_dir_created_later() {
    let fx = Fixture::new();
    std::fs::remove_dir_all(fx.path().join("ws/memory")).unwrap();
    let manager = fx.open(watch_config(&fx)).await;
    manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(manager.status().await.unwrap().files, 1);
    manager.start_background(None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::create_dir_all(fx.path().join("ws/memory")).unwrap();
    std::fs::write(
        fx.path().join("ws/memory/zebra.md"),
        "# Zoo\n\nThe zebra enclosure moved to the north field.\n",
    )
    .unwrap();

    let (saw_dirty, indexed) = watch_until_indexed(&manager, "zebra", "memory/zebra.md").await;
    assert!(indexed, "notes in a late memory/ directory should be indexed");
    assert!(saw_dirty);

    // Later edits inside the new directory are seen too.
    std::fs::write(
        fx.path().join("ws/memory/otter.md"),
        "# Zoo\n\nThe otter pool reopens on Friday.\n",
    )
    .unwrap();
    let (_, indexed) = watch_until_indexed(&manager, "otter", "memory/otter.md").await;
    assert!(indexed, "the new directory should be watched once it exists");
    manager.close().await;
}

// ─── Knowledge graph ────────────────────────────────────────────────

#[tokio::test]
async fn test_knowledge_graph_survives_reindex() {
    let fx = Fixture::new();
    let manager = fx.open(fx.config()).await;
    manager.sync(SyncOptions::default()).await.unwrap();

    let alice = manager
        .add_entity(&NewEntity {
            name: "Alice".into(),
            entity_type: "person".into(),
            ..NewEntity::default()
        })
        .await
        .unwrap();
    let staging = manager
        .add_entity(&NewEntity {
            name: "Staging cluster".into(),
            entity_type: "system".into(),
            ..NewEntity::default()
        })
        .await
        .unwrap();
    manager
        .add_relation(&NewRelation {
            source_id: alice,
            target_id: staging,
            relation: "operates".into(),
            description: None,
        })
        .await
        .unwrap();
    let before = manager.whole_graph().await.unwrap();

    manager
        .sync(SyncOptions::new(SyncReason::Manual).force(true))
        .await
        .unwrap();
    assert_eq!(manager.whole_graph().await.unwrap(), before);
    assert_eq!(manager.search_entities("cluster", 5).await.unwrap().len(), 1);
    assert!(manager
        .graph_context(&["alice".to_string()])
        .await
        .unwrap()
        .contains("operates -> Staging cluster (system)"));
    assert!(fx.temp_files_left().is_empty());
    manager.close().await;
}

// ─── Registry ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_registry_dedups_by_settings() {
    let fx = Fixture::new();
    let registry = ManagerRegistry::new(fx.factory());

    let a = registry.get(fx.config()).await.unwrap();
    let _b = registry.get(fx.config()).await.unwrap();
    assert_eq!(registry.len().await, 1);

    let mut other = fx.config();
    other.query.max_results = 3;
    other.store.path = Some(fx.path().join("db").join("other.sqlite"));
    registry.get(other).await.unwrap();
    assert_eq!(registry.len().await, 2);

    let key = memory_index::registry::registry_key(a.config()).unwrap();
    assert!(registry.close(&key).await);
    assert!(!registry.close(&key).await);
    assert_eq!(registry.len().await, 1);

    registry.close_all().await;
    assert!(registry.is_empty().await);
}
