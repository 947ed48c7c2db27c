//! TOML configuration for the memory index.
//!
//! Every section has defaults, so an empty file is a valid configuration
//! that indexes `MEMORY.md` and `memory/` in the current directory with the
//! OpenAI embedding provider.
//!
//! ```toml
//! agent_id = "main"
//! workspace = "~/notes"
//! sources = ["memory", "sessions"]
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! fallback = "local"
//!
//! [query.hybrid]
//! vector_weight = 0.7
//! text_weight = 0.3
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use memory_index_core::chunk::ChunkingParams;
use memory_index_core::models::MemorySource;
use memory_index_core::transcript::DeltaThresholds;

/// Default OpenAI embedding model.
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
/// Default Gemini embedding model.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-embedding-001";
/// Default local (Ollama) embedding model.
pub const DEFAULT_LOCAL_MODEL: &str = "nomic-embed-text";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent that owns this index; scopes the sessions directory and db file.
    pub agent_id: String,
    /// Root of the memory workspace. `read_file` never escapes it.
    pub workspace: PathBuf,
    pub sources: Vec<MemorySource>,
    /// Additional markdown files or directories to index as memory.
    pub extra_paths: Vec<PathBuf>,
    /// Glob patterns (relative to the workspace) excluded from memory listing.
    pub exclude_globs: Vec<String>,
    /// Transcript directory. Defaults to `<state>/agents/<agent_id>/sessions`.
    pub sessions_dir: Option<PathBuf>,
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub sync: SyncConfig,
    pub query: QueryConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            workspace: PathBuf::from("."),
            sources: vec![MemorySource::Memory],
            extra_paths: Vec::new(),
            exclude_globs: Vec::new(),
            sessions_dir: None,
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            sync: SyncConfig::default(),
            query: QueryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_agent_id() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file. Defaults to `<state>/memory/<agent_id>.sqlite`.
    pub path: Option<PathBuf>,
    pub vector: VectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub enabled: bool,
    /// Path to the sqlite-vec loadable extension. Without it vector search
    /// scans stored embeddings in process.
    pub extension_path: Option<PathBuf>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extension_path: None,
        }
    }
}

/// Embedding backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Gemini,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Local => "local",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Model id. Each provider has its own default.
    pub model: Option<String>,
    /// Provider to switch to when the primary fails during sync.
    pub fallback: Option<ProviderKind>,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Openai,
            model: None,
            fallback: None,
            remote: RemoteConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    /// Falls back to `OPENAI_API_KEY` / `GEMINI_API_KEY` when unset.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Extra request headers. Auth headers are excluded from the provider key.
    pub headers: BTreeMap<String, String>,
    pub batch: BatchConfig,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("batch", &self.batch)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Wait for submitted jobs to finish. Without waiting the sync falls
    /// back to direct embedding.
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait: true,
            concurrency: 2,
            poll_interval_ms: 2_000,
            timeout_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Ollama endpoint used when the `local-embeddings-fastembed` feature is off.
    pub url: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: default_chunk_tokens(),
            overlap: default_chunk_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            tokens: self.tokens,
            overlap: self.overlap,
        }
    }
}

fn default_chunk_tokens() -> usize {
    400
}
fn default_chunk_overlap() -> usize {
    80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub on_session_start: bool,
    pub on_search: bool,
    pub watch: bool,
    pub watch_debounce_ms: u64,
    /// Periodic sync interval; `0` disables it.
    pub interval_minutes: u64,
    pub sessions: SessionSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_session_start: true,
            on_search: true,
            watch: true,
            watch_debounce_ms: 1_500,
            interval_minutes: 0,
            sessions: SessionSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSyncConfig {
    pub delta_bytes: u64,
    pub delta_messages: u64,
}

impl Default for SessionSyncConfig {
    fn default() -> Self {
        Self {
            delta_bytes: 100_000,
            delta_messages: 50,
        }
    }
}

impl SessionSyncConfig {
    pub fn thresholds(&self) -> DeltaThresholds {
        DeltaThresholds {
            bytes: self.delta_bytes,
            messages: self.delta_messages,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_results: usize,
    pub min_score: f64,
    pub hybrid: HybridConfig,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.35,
            hybrid: HybridConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub enabled: bool,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub candidate_multiplier: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Keep at most this many cache rows after a full reindex.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: None,
        }
    }
}

impl Config {
    /// Effective database path.
    pub fn db_path(&self) -> PathBuf {
        match &self.store.path {
            Some(p) => expand_home(p),
            None => state_dir()
                .join("memory")
                .join(format!("{}.sqlite", self.agent_id)),
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.workspace)
    }

    /// Effective transcript directory for this agent.
    pub fn sessions_dir(&self) -> PathBuf {
        match &self.sessions_dir {
            Some(p) => expand_home(p),
            None => state_dir()
                .join("agents")
                .join(&self.agent_id)
                .join("sessions"),
        }
    }

    pub fn has_source(&self, source: MemorySource) -> bool {
        self.sources.contains(&source)
    }

    /// Model id for `kind`, honouring the configured model only for the
    /// primary provider.
    pub fn model_for(&self, kind: ProviderKind) -> String {
        if kind == self.embedding.provider {
            if let Some(model) = &self.embedding.model {
                return model.clone();
            }
        }
        match kind {
            ProviderKind::Openai => DEFAULT_OPENAI_MODEL.to_string(),
            ProviderKind::Gemini => DEFAULT_GEMINI_MODEL.to_string(),
            ProviderKind::Local => DEFAULT_LOCAL_MODEL.to_string(),
        }
    }

    /// Candidate pool size for one retrieval strategy.
    pub fn candidate_pool(&self, max_results: usize) -> usize {
        let raw = (max_results as f64 * self.query.hybrid.candidate_multiplier).floor();
        (raw as usize).clamp(1, 200)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            bail!("agent_id must not be empty");
        }
        if self.chunking.tokens == 0 {
            bail!("chunking.tokens must be > 0");
        }
        if self.chunking.overlap >= self.chunking.tokens {
            bail!("chunking.overlap must be smaller than chunking.tokens");
        }
        if self.query.max_results == 0 {
            bail!("query.max_results must be >= 1");
        }
        let h = &self.query.hybrid;
        if !(0.0..=1.0).contains(&h.vector_weight) || !(0.0..=1.0).contains(&h.text_weight) {
            bail!("query.hybrid weights must be in [0.0, 1.0]");
        }
        if h.candidate_multiplier <= 0.0 {
            bail!("query.hybrid.candidate_multiplier must be > 0");
        }
        if self.sources.is_empty() {
            bail!("sources must name at least one of: memory, sessions");
        }
        if self.embedding.remote.batch.concurrency == 0 {
            bail!("embedding.remote.batch.concurrency must be >= 1");
        }
        Ok(())
    }
}

/// Root for default state: `~/.memx`.
pub fn state_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".memx"))
        .unwrap_or_else(|| PathBuf::from(".memx"))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
