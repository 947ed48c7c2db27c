//! Local embedding providers.
//!
//! [`OllamaEmbeddings`] talks to an Ollama daemon over HTTP. With the
//! `local-embeddings-fastembed` feature, `FastembedEmbeddings` runs the model
//! in process; the model is loaded once, on first use, on a blocking thread.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::key::compute_provider_key;
use super::{error_for_response, EmbeddingProvider, ProviderClass};

/// Embeddings from a local Ollama instance via `POST {url}/api/embed`.
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
    provider_key: String,
}

impl OllamaEmbeddings {
    pub fn new(url: &str, model: String) -> Result<Self> {
        let url = url.trim_end_matches('/').to_string();
        let provider_key = compute_provider_key("local", Some(&url), &model, None);
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            url,
            model,
            provider_key,
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
                .map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect()
                })
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn id(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }

    fn class(&self) -> ProviderClass {
        ProviderClass::Local
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url,
                    e
                )
            })?;
        if !resp.status().is_success() {
            return Err(error_for_response("Ollama", resp).await);
        }
        let json: serde_json::Value = resp.json().await?;
        let out = parse_ollama_response(&json)?;
        if out.len() != texts.len() {
            anyhow::bail!("Ollama returned {} embeddings for {} inputs", out.len(), texts.len());
        }
        Ok(out)
    }
}

// ============ In-process (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub use fastembed_provider::FastembedEmbeddings;

#[cfg(feature = "local-embeddings-fastembed")]
mod fastembed_provider {
    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    use super::super::key::compute_provider_key;
    use super::super::{EmbeddingProvider, ProviderClass};

    fn to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
            "nomic-embed-text" | "nomic-embed-text-v1.5" => {
                Ok(fastembed::EmbeddingModel::NomicEmbedTextV15)
            }
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1, nomic-embed-text-v1.5, \
                 multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
                other
            ),
        }
    }

    pub struct FastembedEmbeddings {
        model_name: String,
        model: fastembed::EmbeddingModel,
        provider_key: String,
        loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl FastembedEmbeddings {
        pub fn new(model_name: &str) -> Result<Self> {
            Ok(Self {
                model_name: model_name.to_string(),
                model: to_fastembed_model(model_name)?,
                provider_key: compute_provider_key("local", None, model_name, None),
                loaded: Arc::new(Mutex::new(None)),
            })
        }

        async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            let loaded = Arc::clone(&self.loaded);
            let model = self.model.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = loaded
                    .lock()
                    .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
                if guard.is_none() {
                    let init = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model).with_show_download_progress(true),
                    )
                    .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                    *guard = Some(init);
                }
                let embedder = guard
                    .as_mut()
                    .ok_or_else(|| anyhow!("local embedding model not loaded"))?;
                embedder
                    .embed(texts, None)
                    .map_err(|e| anyhow!("Local embedding failed: {}", e))
            })
            .await?
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastembedEmbeddings {
        fn id(&self) -> &str {
            "local"
        }

        fn model(&self) -> &str {
            &self.model_name
        }

        fn provider_key(&self) -> &str {
            &self.provider_key
        }

        fn class(&self) -> ProviderClass {
            ProviderClass::Local
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            self.run(vec![text.to_string()])
                .await?
                .pop()
                .ok_or_else(|| anyhow!("empty embedding response"))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            self.run(texts.to_vec()).await
        }
    }
}
