//! Failure budget for provider batch embedding.
//!
//! Batch jobs are slow and can fail for account-level reasons, so a run of
//! failures turns batch mode off for the rest of the manager's life. Every
//! failure falls back to direct embedding, so a sync never fails just
//! because batch mode did.

use anyhow::Result;
use serde::Serialize;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{is_timeout, MemoryError};

/// Consecutive failures that disable batch mode.
pub const BATCH_FAILURE_LIMIT: u32 = 2;

#[derive(Debug, Default)]
struct BatchState {
    enabled: bool,
    failures: u32,
    last_error: Option<String>,
    last_provider: Option<String>,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub enabled: bool,
    pub failures: u32,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_provider: Option<String>,
}

pub struct BatchManager {
    state: Mutex<BatchState>,
}

struct BatchFailure {
    error: anyhow::Error,
    attempts: u32,
}

fn forces_disable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<MemoryError>(),
            Some(MemoryError::BatchUnavailable(_))
        )
    }) || format!("{:#}", err).contains("asyncBatchEmbedContent not available")
}

impl BatchManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: Mutex::new(BatchState {
                enabled,
                ..BatchState::default()
            }),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn status(&self) -> BatchStatus {
        let state = self.state.lock().await;
        BatchStatus {
            enabled: state.enabled,
            failures: state.failures,
            limit: BATCH_FAILURE_LIMIT,
            last_error: state.last_error.clone(),
            last_provider: state.last_provider.clone(),
        }
    }

    async fn reset_failures(&self) {
        let mut state = self.state.lock().await;
        if state.failures > 0 {
            debug!("batch embedding recovered; resetting failure count");
        }
        state.failures = 0;
        state.last_error = None;
        state.last_provider = None;
    }

    /// Count a failure. Returns whether batch mode is now off and the count.
    async fn record_failure(
        &self,
        provider: &str,
        message: String,
        attempts: u32,
        force_disable: bool,
    ) -> (bool, u32) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return (true, state.failures);
        }
        state.failures += if force_disable {
            BATCH_FAILURE_LIMIT
        } else {
            attempts.max(1)
        };
        state.last_error = Some(message);
        state.last_provider = Some(provider.to_string());
        let disabled = force_disable || state.failures >= BATCH_FAILURE_LIMIT;
        if disabled {
            state.enabled = false;
        }
        (disabled, state.failures)
    }

    /// Run `run` once; on a timeout, run it once more.
    async fn run_with_timeout_retry<T, R, RFut>(
        &self,
        provider: &str,
        run: &mut R,
    ) -> std::result::Result<T, BatchFailure>
    where
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<T>>,
    {
        match run().await {
            Ok(v) => Ok(v),
            Err(err) if is_timeout(&err) => {
                warn!(provider, "batch embedding timed out; retrying once");
                run().await.map_err(|error| BatchFailure { error, attempts: 2 })
            }
            Err(error) => Err(BatchFailure { error, attempts: 1 }),
        }
    }

    /// Try the batch path, falling back to `fallback` when batch mode is off
    /// or the batch attempt fails.
    pub async fn run_with_fallback<T, R, RFut, F, FFut>(
        &self,
        provider: &str,
        mut run: R,
        fallback: F,
    ) -> Result<T>
    where
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<T>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T>>,
    {
        if !self.is_enabled().await {
            return fallback().await;
        }
        match self.run_with_timeout_retry(provider, &mut run).await {
            Ok(value) => {
                self.reset_failures().await;
                Ok(value)
            }
            Err(BatchFailure { error, attempts }) => {
                let message = format!("{:#}", error);
                let (disabled, count) = self
                    .record_failure(provider, message.clone(), attempts, forces_disable(&error))
                    .await;
                warn!(
                    provider,
                    failures = count,
                    limit = BATCH_FAILURE_LIMIT,
                    disabled,
                    error = %message,
                    "batch embedding failed; falling back to direct embedding"
                );
                fallback().await
            }
        }
    }
}
