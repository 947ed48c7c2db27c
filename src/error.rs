//! Typed failures callers may want to match on.
//!
//! Most code propagates `anyhow::Error`; these variants are wrapped into it
//! and recovered with `downcast_ref` where the distinction matters (tests,
//! the batch failure budget, the CLI exit message).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("path escapes the memory workspace: {0}")]
    PathOutsideWorkspace(String),

    #[error("invalid memory path: {0}")]
    InvalidPath(String),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("batch {0} was submitted but wait is disabled; falling back to direct embedding")]
    BatchNotAwaited(String),

    #[error("batch embedding is not available for provider {0}")]
    BatchUnavailable(String),

    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("vector dimensions changed from {expected} to {actual}")]
    DimensionsChanged { expected: usize, actual: usize },

    #[error("unknown graph entity: {0}")]
    UnknownEntity(String),
}

impl MemoryError {
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        MemoryError::Timeout { operation, after }
    }
}

/// True when `err` (or anything in its chain) is a [`MemoryError::Timeout`].
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<MemoryError>(),
            Some(MemoryError::Timeout { .. })
        )
    })
}

/// The new vector size when `err` reports that the index was built for
/// another one, which only a full rebuild can resolve.
pub fn dimension_change(err: &anyhow::Error) -> Option<usize> {
    err.chain().find_map(|cause| match cause.downcast_ref::<MemoryError>() {
        Some(MemoryError::DimensionsChanged { actual, .. }) => Some(*actual),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detected_through_context() {
        let err = anyhow::Error::new(MemoryError::timeout("batch", Duration::from_secs(5)))
            .context("embedding chunks");
        assert!(is_timeout(&err));
        assert!(!is_timeout(&anyhow::anyhow!("boom")));
    }

    #[test]
    fn test_dimension_change_detected_through_context() {
        let err = anyhow::Error::new(MemoryError::DimensionsChanged {
            expected: 1536,
            actual: 768,
        })
        .context("indexing memory/a.md");
        assert_eq!(dimension_change(&err), Some(768));
        assert_eq!(dimension_change(&anyhow::anyhow!("boom")), None);
        assert!(!crate::sync::is_embedding_failure(&err));
    }

    #[test]
    fn test_messages() {
        let e = MemoryError::timeout("query embedding", Duration::from_secs(60));
        assert_eq!(e.to_string(), "query embedding timed out after 60s");
        let e = MemoryError::PathOutsideWorkspace("../etc/passwd".into());
        assert!(e.to_string().contains("../etc/passwd"));
    }
}
