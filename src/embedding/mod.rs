//! Embedding provider abstraction and implementations.
//!
//! Every backend implements [`EmbeddingProvider`]:
//! - **[`OpenAiEmbeddings`]** calls `POST {base}/embeddings` and supports the
//!   OpenAI Batch API.
//! - **[`GeminiEmbeddings`]** calls `:embedContent` / `:batchEmbedContents`
//!   and supports `:asyncBatchEmbedContent`.
//! - **[`OllamaEmbeddings`]** calls a local Ollama instance's `/api/embed`.
//! - **`FastembedEmbeddings`** runs a model in process (feature
//!   `local-embeddings-fastembed`).
//!
//! # Provider Selection
//!
//! The backend is chosen once, from [`ProviderKind`], by a
//! [`ProviderFactory`]. The manager only swaps it through its explicit
//! fallback transition; no other code branches on the provider id.
//!
//! # Timeouts
//!
//! | Class | Query | Batch |
//! |-------|-------|-------|
//! | local | 15s | 60s |
//! | remote | 60s | 120s |

pub mod gemini;
pub mod key;
pub mod local;
pub mod openai;
pub mod retry;

use anyhow::{Context, Result};
use async_trait::async_trait;
use secrecy::Secret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, ProviderKind};
use crate::error::MemoryError;

pub use gemini::GeminiEmbeddings;
pub use key::compute_provider_key;
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::FastembedEmbeddings;
pub use local::OllamaEmbeddings;
pub use openai::OpenAiEmbeddings;

/// Whether a provider runs on this machine or behind a network API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderClass {
    Local,
    Remote,
}

impl ProviderClass {
    pub fn query_timeout(&self) -> Duration {
        match self {
            ProviderClass::Local => Duration::from_secs(15),
            ProviderClass::Remote => Duration::from_secs(60),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        match self {
            ProviderClass::Local => Duration::from_secs(60),
            ProviderClass::Remote => Duration::from_secs(120),
        }
    }
}

/// One chunk submitted to a provider batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub custom_id: String,
    pub text: String,
}

/// How a batch job is submitted and awaited.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Asynchronous bulk embedding offered by some remote providers.
#[async_trait]
pub trait BatchEmbedder: Send + Sync {
    /// Submit `requests`, wait for completion, and return embeddings keyed
    /// by `custom_id`.
    async fn run_batch(
        &self,
        requests: &[BatchRequest],
        options: &BatchOptions,
    ) -> Result<HashMap<String, Vec<f32>>>;
}

/// Uniform embedding interface over every backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider id, e.g. `"openai"`.
    fn id(&self) -> &str;
    fn model(&self) -> &str;
    /// Fingerprint of provider, model, and connection settings.
    fn provider_key(&self) -> &str;
    fn class(&self) -> ProviderClass;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Batch API, when the provider has one.
    fn batch_api(&self) -> Option<&dyn BatchEmbedder> {
        None
    }
}

/// Builds providers. Hosts and tests can supply their own.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, config: &Config) -> Result<Arc<dyn EmbeddingProvider>>;
}

/// Factory for the built-in HTTP and in-process providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(&self, kind: ProviderKind, config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
        create_provider(kind, config)
    }
}

/// Create the backend for `kind` from configuration.
///
/// | Kind | Provider |
/// |------|----------|
/// | `openai` | [`OpenAiEmbeddings`] |
/// | `gemini` | [`GeminiEmbeddings`] |
/// | `local` | `FastembedEmbeddings` with the feature, else [`OllamaEmbeddings`] |
pub fn create_provider(kind: ProviderKind, config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let model = config.model_for(kind);
    let remote = &config.embedding.remote;
    match kind {
        ProviderKind::Openai => {
            let api_key = resolve_api_key(remote.api_key.as_deref(), &["OPENAI_API_KEY"])
                .ok_or_else(|| {
                    MemoryError::ProviderUnavailable(
                        "openai: set embedding.remote.api_key or OPENAI_API_KEY".into(),
                    )
                })?;
            let provider = OpenAiEmbeddings::new(
                api_key,
                remote.base_url.clone(),
                model,
                remote.headers.clone(),
            )
            .context("Failed to build OpenAI embedding client")?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Gemini => {
            let api_key =
                resolve_api_key(remote.api_key.as_deref(), &["GEMINI_API_KEY", "GOOGLE_API_KEY"])
                    .ok_or_else(|| {
                        MemoryError::ProviderUnavailable(
                            "gemini: set embedding.remote.api_key or GEMINI_API_KEY".into(),
                        )
                    })?;
            let provider = GeminiEmbeddings::new(
                api_key,
                remote.base_url.clone(),
                model,
                remote.headers.clone(),
            )
            .context("Failed to build Gemini embedding client")?;
            Ok(Arc::new(provider))
        }
        #[cfg(feature = "local-embeddings-fastembed")]
        ProviderKind::Local => Ok(Arc::new(FastembedEmbeddings::new(&model)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        ProviderKind::Local => Ok(Arc::new(OllamaEmbeddings::new(
            &config.embedding.local.url,
            model,
        )?)),
    }
}

fn resolve_api_key(configured: Option<&str>, env_vars: &[&str]) -> Option<Secret<String>> {
    if let Some(key) = configured.filter(|k| !k.trim().is_empty()) {
        return Some(Secret::new(key.to_string()));
    }
    env_vars
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.trim().is_empty())
        .map(Secret::new)
}

/// Turn a non-success HTTP response into an error carrying status and body,
/// so retry classification can see codes like `429` or `503`.
pub(crate) async fn error_for_response(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::anyhow!("{} API error {}: {}", provider, status, body)
}
