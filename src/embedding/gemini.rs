//! Gemini embeddings client.
//!
//! Queries use `:embedContent` with `RETRIEVAL_QUERY`; documents use
//! `:batchEmbedContents` with `RETRIEVAL_DOCUMENT`. Bulk indexing can go
//! through `:asyncBatchEmbedContent`, which reads a JSONL file uploaded with
//! the resumable upload protocol and writes a responses file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info};

use super::key::compute_provider_key;
use super::{
    error_for_response, BatchEmbedder, BatchOptions, BatchRequest, EmbeddingProvider,
    ProviderClass,
};
use crate::error::MemoryError;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const GEMINI_BATCH_MAX_REQUESTS: usize = 50_000;
const TASK_QUERY: &str = "RETRIEVAL_QUERY";
const TASK_DOCUMENT: &str = "RETRIEVAL_DOCUMENT";

pub struct GeminiEmbeddings {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    headers: BTreeMap<String, String>,
    provider_key: String,
}

impl GeminiEmbeddings {
    pub fn new(
        api_key: Secret<String>,
        base_url: Option<String>,
        model: String,
        headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = model.trim_start_matches("models/").to_string();
        let provider_key = compute_provider_key("gemini", Some(&base_url), &model, Some(&headers));
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_key,
            base_url,
            model,
            headers,
            provider_key,
        })
    }

    fn model_path(&self) -> String {
        format!("models/{}", self.model)
    }

    /// Host root without the API version, for upload and download paths.
    fn api_root(&self) -> &str {
        self.base_url
            .strip_suffix("/v1beta")
            .or_else(|| self.base_url.strip_suffix("/v1"))
            .unwrap_or(&self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("x-goog-api-key", self.api_key.expose_secret());
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }

    fn content_request<'a>(&'a self, text: &'a str, task: &'static str) -> ContentRequest<'a> {
        ContentRequest {
            model: self.model_path(),
            content: Content {
                parts: vec![Part { text }],
            },
            task_type: task,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    model: String,
    content: Content<'a>,
    task_type: &'static str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    embedding: ContentEmbedding,
}

#[derive(Deserialize)]
struct BatchEmbedContentsResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddings {
    fn id(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }

    fn class(&self) -> ProviderClass {
        ProviderClass::Remote
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/{}:embedContent", self.base_url, self.model_path());
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&self.content_request(text, TASK_QUERY))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini", resp).await);
        }
        let body: EmbedContentResponse = resp.json().await?;
        Ok(body.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/{}:batchEmbedContents", self.base_url, self.model_path());
        let requests: Vec<ContentRequest<'_>> = texts
            .iter()
            .map(|t| self.content_request(t, TASK_DOCUMENT))
            .collect();
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini", resp).await);
        }
        let body: BatchEmbedContentsResponse = resp.json().await?;
        if body.embeddings.len() != texts.len() {
            bail!(
                "Gemini returned {} embeddings for {} inputs",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings.into_iter().map(|e| e.values).collect())
    }

    fn batch_api(&self) -> Option<&dyn BatchEmbedder> {
        Some(self)
    }
}

// ============ Async Batch ============

#[derive(Serialize)]
struct BatchLine<'a> {
    key: &'a str,
    request: ContentRequest<'a>,
}

/// Batch job as returned by create and poll; the service wraps it in an
/// operation, so fields are looked up in both places.
struct BatchJob {
    name: String,
    state: String,
    responses_file: Option<String>,
    error: Option<String>,
}

impl BatchJob {
    fn from_value(v: &Value) -> Result<Self> {
        let name = v
            .get("name")
            .and_then(Value::as_str)
            .context("Gemini batch response has no name")?
            .to_string();
        let meta = v.get("metadata").unwrap_or(v);
        let state = meta
            .get("state")
            .or_else(|| v.get("state"))
            .and_then(Value::as_str)
            .unwrap_or(if v.get("done").and_then(Value::as_bool) == Some(true) {
                "BATCH_STATE_SUCCEEDED"
            } else {
                "BATCH_STATE_PENDING"
            })
            .to_string();
        let responses_file = [
            meta.pointer("/output/responsesFile"),
            v.pointer("/response/responsesFile"),
            v.pointer("/output/responsesFile"),
        ]
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .map(str::to_string);
        let error = v.get("error").map(|e| e.to_string());
        Ok(Self {
            name,
            state,
            responses_file,
            error,
        })
    }
}

#[derive(Deserialize)]
struct OutputLine {
    key: String,
    #[serde(default)]
    response: Option<EmbedContentResponse>,
    #[serde(default)]
    error: Option<Value>,
}

impl GeminiEmbeddings {
    async fn upload_jsonl(&self, jsonl: String) -> Result<String> {
        let start_url = format!("{}/upload/v1beta/files", self.api_root());
        let start = self
            .request(reqwest::Method::POST, &start_url)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", jsonl.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", "application/jsonl")
            .json(&serde_json::json!({ "file": { "display_name": "memory-embeddings" } }))
            .send()
            .await?;
        if !start.status().is_success() {
            return Err(error_for_response("Gemini upload", start).await);
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|h| h.to_str().ok())
            .context("Gemini upload did not return an upload URL")?
            .to_string();

        let resp = self
            .request(reqwest::Method::POST, &upload_url)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .body(jsonl)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini upload", resp).await);
        }
        let body: Value = resp.json().await?;
        body.pointer("/file/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Gemini upload response has no file name")
    }

    async fn create_batch(&self, file_name: &str) -> Result<BatchJob> {
        let url = format!("{}/{}:asyncBatchEmbedContent", self.base_url, self.model_path());
        let resp = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({
                "batch": {
                    "displayName": "memory-embeddings",
                    "inputConfig": { "fileName": file_name },
                }
            }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MemoryError::BatchUnavailable(format!(
                "gemini (asyncBatchEmbedContent not available for {})",
                self.model
            ))
            .into());
        }
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini batch create", resp).await);
        }
        BatchJob::from_value(&resp.json::<Value>().await?)
    }

    async fn fetch_batch(&self, name: &str) -> Result<BatchJob> {
        let url = format!("{}/{}", self.base_url, name);
        let resp = self.request(reqwest::Method::GET, &url).send().await?;
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini batch status", resp).await);
        }
        BatchJob::from_value(&resp.json::<Value>().await?)
    }

    async fn download(&self, file_name: &str) -> Result<String> {
        let url = format!(
            "{}/download/v1beta/{}:download?alt=media",
            self.api_root(),
            file_name
        );
        let resp = self.request(reqwest::Method::GET, &url).send().await?;
        if !resp.status().is_success() {
            return Err(error_for_response("Gemini batch download", resp).await);
        }
        Ok(resp.text().await?)
    }

    async fn wait_for_batch(&self, mut job: BatchJob, options: &BatchOptions) -> Result<BatchJob> {
        let started = Instant::now();
        loop {
            if job.state.contains("SUCCEEDED") {
                return Ok(job);
            }
            if ["FAILED", "CANCELLED", "EXPIRED"]
                .iter()
                .any(|s| job.state.contains(s))
            {
                bail!(
                    "Gemini batch {} {}: {}",
                    job.name,
                    job.state,
                    job.error.as_deref().unwrap_or("no details")
                );
            }
            if !options.wait {
                return Err(MemoryError::BatchNotAwaited(job.name).into());
            }
            if started.elapsed() >= options.timeout {
                return Err(MemoryError::timeout("gemini batch", options.timeout).into());
            }
            debug!(batch = %job.name, state = %job.state, "waiting for gemini batch");
            tokio::time::sleep(options.poll_interval).await;
            job = self.fetch_batch(&job.name).await?;
        }
    }

    async fn run_group(
        &self,
        group: &[BatchRequest],
        options: &BatchOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut jsonl = String::new();
        for r in group {
            let line = BatchLine {
                key: &r.custom_id,
                request: self.content_request(&r.text, TASK_DOCUMENT),
            };
            jsonl.push_str(&serde_json::to_string(&line)?);
            jsonl.push('\n');
        }
        let file_name = self.upload_jsonl(jsonl).await?;
        let job = self.create_batch(&file_name).await?;
        info!(batch = %job.name, requests = group.len(), "submitted gemini embedding batch");
        let done = self.wait_for_batch(job, options).await?;
        let responses = done
            .responses_file
            .with_context(|| format!("Gemini batch {} completed without responses", done.name))?;
        parse_output(&self.download(&responses).await?)
    }
}

fn parse_output(content: &str) -> Result<HashMap<String, Vec<f32>>> {
    let mut out = HashMap::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: OutputLine =
            serde_json::from_str(line).context("Invalid Gemini batch output line")?;
        if let Some(err) = parsed.error {
            bail!("Gemini batch request {} failed: {}", parsed.key, err);
        }
        let response = parsed
            .response
            .with_context(|| format!("Gemini batch request {} has no response", parsed.key))?;
        out.insert(parsed.key, response.embedding.values);
    }
    Ok(out)
}

#[async_trait]
impl BatchEmbedder for GeminiEmbeddings {
    async fn run_batch(
        &self,
        requests: &[BatchRequest],
        options: &BatchOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let groups: Vec<_> = requests
            .chunks(GEMINI_BATCH_MAX_REQUESTS)
            .map(|group| self.run_group(group, options).boxed())
            .collect();
        let results: Vec<HashMap<String, Vec<f32>>> =
            stream::iter(groups)
                .buffer_unordered(options.concurrency.max(1))
                .try_collect()
                .await?;
        Ok(results.into_iter().flatten().collect())
    }
}
