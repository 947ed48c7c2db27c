//! Retry and timeout helpers for embedding calls.
//!
//! Rate limits and server errors are retried with exponential backoff and
//! jitter; anything else propagates on the first failure. Timeouts are hard
//! failures: the remote side is not cancelled.

use anyhow::Result;
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

use crate::error::MemoryError;

/// Retries after the first attempt.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const RETRY_MAX_DELAY: Duration = Duration::from_millis(8_000);
/// Jitter applied to each delay, as a fraction (±20%).
const RETRY_JITTER: f64 = 0.2;

fn retryable_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(rate[_ ]limit|too many requests|\b429\b|\b5\d\d\b|resource has been exhausted|bad gateway|gateway timeout|cloudflare)",
            )
            .ok()
        })
        .as_ref()
}

/// Whether an embedding error is worth retrying.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    retryable_pattern().is_some_and(|re| re.is_match(&format!("{:#}", err)))
}

/// Delay before retry number `attempt` (1-based), before jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    RETRY_BASE_DELAY
        .saturating_mul(factor)
        .min(RETRY_MAX_DELAY)
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = rand::rng().random_range(-RETRY_JITTER..=RETRY_JITTER);
    delay.mul_f64(1.0 + spread)
}

/// Run `op`, retrying retryable failures with backoff.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_MAX_ATTEMPTS && is_retryable(&err) => {
                attempt += 1;
                let delay = with_jitter(backoff_delay(attempt));
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", err),
                    "retrying embedding request"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bound `fut` by `after`, mapping expiry to [`MemoryError::Timeout`].
pub async fn with_timeout<T, Fut>(operation: &'static str, after: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(MemoryError::timeout(operation, after).into()),
    }
}
