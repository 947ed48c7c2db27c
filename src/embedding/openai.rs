//! OpenAI embeddings and Batch API client.
//!
//! Direct embedding posts to `{base}/embeddings`. Batch embedding uploads a
//! JSONL file of `/v1/embeddings` requests, creates a batch with a 24h
//! completion window, polls it, and downloads the output file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, info};

use super::key::compute_provider_key;
use super::{
    error_for_response, BatchEmbedder, BatchOptions, BatchRequest, EmbeddingProvider,
    ProviderClass,
};
use crate::error::MemoryError;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Requests per uploaded batch file.
const OPENAI_BATCH_MAX_REQUESTS: usize = 50_000;
const BATCH_ENDPOINT: &str = "/v1/embeddings";
const BATCH_COMPLETION_WINDOW: &str = "24h";

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    headers: BTreeMap<String, String>,
    provider_key: String,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: Secret<String>,
        base_url: Option<String>,
        model: String,
        headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let provider_key = compute_provider_key("openai", Some(&base_url), &model, Some(&headers));
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_key,
            base_url,
            model,
            headers,
            provider_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.api_key.expose_secret());
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        builder
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

fn into_ordered(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    if data.len() != expected {
        bail!(
            "OpenAI returned {} embeddings for {} inputs",
            data.len(),
            expected
        );
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn id(&self) -> &str {
        "openai"
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
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .request(reqwest::Method::POST, "/embeddings")
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("OpenAI", resp).await);
        }
        let body: EmbeddingResponse = resp.json().await?;
        into_ordered(body.data, texts.len())
    }

    fn batch_api(&self) -> Option<&dyn BatchEmbedder> {
        Some(self)
    }
}

// ============ Batch API ============

#[derive(Serialize)]
struct BatchLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: BatchLineBody<'a>,
}

#[derive(Serialize)]
struct BatchLineBody<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
}

#[derive(Deserialize)]
struct BatchOutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<BatchOutputResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct BatchOutputResponse {
    status_code: u16,
    body: serde_json::Value,
}

impl OpenAiEmbeddings {
    fn build_jsonl(&self, requests: &[BatchRequest]) -> Result<String> {
        let mut out = String::new();
        for r in requests {
            let line = BatchLine {
                custom_id: &r.custom_id,
                method: "POST",
                url: BATCH_ENDPOINT,
                body: BatchLineBody {
                    model: &self.model,
                    input: &r.text,
                },
            };
            out.push_str(&serde_json::to_string(&line)?);
            out.push('\n');
        }
        Ok(out)
    }

    async fn upload_batch_file(&self, jsonl: String) -> Result<String> {
        let part = reqwest::multipart::Part::text(jsonl)
            .file_name("memory-embeddings.jsonl")
            .mime_str("application/jsonl")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);
        let resp = self
            .request(reqwest::Method::POST, "/files")
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("OpenAI batch file upload", resp).await);
        }
        Ok(resp.json::<FileObject>().await?.id)
    }

    async fn create_batch(&self, input_file_id: &str) -> Result<BatchObject> {
        let resp = self
            .request(reqwest::Method::POST, "/batches")
            .json(&serde_json::json!({
                "input_file_id": input_file_id,
                "endpoint": BATCH_ENDPOINT,
                "completion_window": BATCH_COMPLETION_WINDOW,
                "metadata": { "source": "memory-index" },
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("OpenAI batch create", resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn fetch_batch(&self, id: &str) -> Result<BatchObject> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/batches/{}", id))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("OpenAI batch status", resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn file_content(&self, file_id: &str) -> Result<String> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/files/{}/content", file_id))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response("OpenAI batch download", resp).await);
        }
        Ok(resp.text().await?)
    }

    async fn wait_for_batch(&self, mut batch: BatchObject, options: &BatchOptions) -> Result<BatchObject> {
        let started = Instant::now();
        loop {
            match batch.status.as_str() {
                "completed" => return Ok(batch),
                "failed" | "expired" | "cancelled" | "cancelling" => {
                    let detail = match &batch.error_file_id {
                        Some(file) => self.file_content(file).await.unwrap_or_default(),
                        None => String::new(),
                    };
                    bail!("OpenAI batch {} {}: {}", batch.id, batch.status, detail.trim());
                }
                _ => {}
            }
            if !options.wait {
                return Err(MemoryError::BatchNotAwaited(batch.id).into());
            }
            if started.elapsed() >= options.timeout {
                return Err(MemoryError::timeout("openai batch", options.timeout).into());
            }
            debug!(batch = %batch.id, status = %batch.status, "waiting for openai batch");
            tokio::time::sleep(options.poll_interval).await;
            batch = self.fetch_batch(&batch.id).await?;
        }
    }

    async fn run_group(
        &self,
        group: &[BatchRequest],
        options: &BatchOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let file_id = self.upload_batch_file(self.build_jsonl(group)?).await?;
        let batch = self.create_batch(&file_id).await?;
        info!(batch = %batch.id, requests = group.len(), "submitted openai embedding batch");
        let done = self.wait_for_batch(batch, options).await?;
        let output_file = done
            .output_file_id
            .with_context(|| format!("OpenAI batch {} completed without output", done.id))?;
        let content = self.file_content(&output_file).await?;
        parse_batch_output(&content)
    }
}

fn parse_batch_output(content: &str) -> Result<HashMap<String, Vec<f32>>> {
    let mut out = HashMap::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: BatchOutputLine =
            serde_json::from_str(line).context("Invalid OpenAI batch output line")?;
        if let Some(err) = parsed.error {
            bail!("OpenAI batch request {} failed: {}", parsed.custom_id, err);
        }
        let response = parsed
            .response
            .with_context(|| format!("OpenAI batch request {} has no response", parsed.custom_id))?;
        if response.status_code >= 400 {
            bail!(
                "OpenAI batch request {} failed with {}: {}",
                parsed.custom_id,
                response.status_code,
                response.body
            );
        }
        let body: EmbeddingResponse = serde_json::from_value(response.body)?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .with_context(|| format!("OpenAI batch request {} returned no embedding", parsed.custom_id))?;
        out.insert(parsed.custom_id, embedding);
    }
    Ok(out)
}

#[async_trait]
impl BatchEmbedder for OpenAiEmbeddings {
    async fn run_batch(
        &self,
        requests: &[BatchRequest],
        options: &BatchOptions,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let groups: Vec<&[BatchRequest]> = requests.chunks(OPENAI_BATCH_MAX_REQUESTS).collect();
        let groups: Vec<_> = groups
            .into_iter()
            .map(|group| self.run_group(group, options).boxed())
            .collect();
        let results: Vec<HashMap<String, Vec<f32>>> = stream::iter(groups)
            .buffer_unordered(options.concurrency.max(1))
            .try_collect()
            .await?;
        let mut merged = HashMap::new();
        for part in results {
            merged.extend(part);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn provider(server: &mockito::Server) -> OpenAiEmbeddings {
        let mut headers = BTreeMap::new();
        headers.insert("X-Team".to_string(), "core".to_string());
        OpenAiEmbeddings::new(
            Secret::new("sk-test".to_string()),
            Some(server.url()),
            "text-embedding-3-small".to_string(),
            headers,
        )
        .unwrap()
    }

    fn options() -> BatchOptions {
        BatchOptions {
            wait: true,
            concurrency: 1,
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_embed_batch_orders_by_index() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/embeddings")
            .match_header("authorization", "Bearer sk-test")
            .match_header("x-team", "core")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let p = provider(&server);
        let out = p
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_carries_status_for_retry() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/embeddings")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;
        let err = provider(&server).embed_query("q").await.unwrap_err();
        assert!(crate::embedding::retry::is_retryable(&err), "{}", err);
    }

    #[tokio::test]
    async fn test_batch_roundtrip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/files")
            .with_status(200)
            .with_body(r#"{"id":"file-in"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/batches")
            .with_status(200)
            .with_body(r#"{"id":"batch_1","status":"validating"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/batches/batch_1")
            .with_status(200)
            .with_body(r#"{"id":"batch_1","status":"completed","output_file_id":"file-out"}"#)
            .create_async()
            .await;
        let output = [
            r#"{"custom_id":"c1","response":{"status_code":200,"body":{"data":[{"index":0,"embedding":[0.1,0.2]}]}}}"#,
            r#"{"custom_id":"c2","response":{"status_code":200,"body":{"data":[{"index":0,"embedding":[0.3,0.4]}]}}}"#,
        ]
        .join("\n");
        server
            .mock("GET", "/files/file-out/content")
            .with_status(200)
            .with_body(output)
            .create_async()
            .await;

        let requests = vec![
            BatchRequest {
                custom_id: "c1".into(),
                text: "one".into(),
            },
            BatchRequest {
                custom_id: "c2".into(),
                text: "two".into(),
            },
        ];
        let out = provider(&server)
            .run_batch(&requests, &options())
            .await
            .unwrap();
        assert_eq!(out["c1"], vec![0.1, 0.2]);
        assert_eq!(out["c2"], vec![0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_batch_without_wait_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/files")
            .with_status(200)
            .with_body(r#"{"id":"file-in"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/batches")
            .with_status(200)
            .with_body(r#"{"id":"batch_2","status":"in_progress"}"#)
            .create_async()
            .await;
        let requests = vec![BatchRequest {
            custom_id: "c1".into(),
            text: "one".into(),
        }];
        let err = provider(&server)
            .run_batch(&requests, &BatchOptions { wait: false, ..options() })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::BatchNotAwaited(_))
        ));
    }

    #[test]
    fn test_batch_output_line_error() {
        let err = parse_batch_output(r#"{"custom_id":"c9","error":{"message":"bad"}}"#).unwrap_err();
        assert!(err.to_string().contains("c9"));
    }
}
