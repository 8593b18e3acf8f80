//! Error taxonomy for the permission cache
//!
//! Collaborators (authorization backend, cache store, task dispatcher) report
//! failures as `anyhow::Error`. The cache classifies them here at its own
//! boundary so callers can match on what went wrong.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cache components
#[derive(Debug, Error)]
pub enum CacheError {
    /// The authorization backend failed (network, timeout, server error).
    ///
    /// `cached` is `true` when the failure was served from an error entry
    /// stored during the error-TTL cooldown instead of a fresh backend call.
    /// This is never turned into an allow/deny answer.
    #[error("authorization backend unavailable during {operation}: {source}")]
    BackendUnavailable {
        operation: &'static str,
        cached: bool,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration rejected at construction time
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),

    /// The cache store failed
    #[error("cache store error during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A synchronous write-behind flush failed; the pending operations were kept
    #[error("write-behind flush failed ({writes} writes, {deletes} deletes pending): {source}")]
    FlushFailure {
        writes: usize,
        deletes: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A stored entry could not be encoded or decoded
    #[error("cache entry codec error: {0}")]
    Codec(#[source] anyhow::Error),

    /// A write task could not be handed to the task dispatcher
    #[error("failed to dispatch write task: {0}")]
    Dispatch(#[source] anyhow::Error),
}

impl CacheError {
    pub(crate) fn backend(operation: &'static str, source: anyhow::Error) -> Self {
        Self::BackendUnavailable {
            operation,
            cached: false,
            source,
        }
    }

    pub(crate) fn store(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store { operation, source }
    }

    /// Whether the error comes from the authorization backend (fresh or cached)
    #[must_use]
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_message() {
        let fresh = CacheError::backend("check", anyhow::anyhow!("connection refused"));
        assert_eq!(
            fresh.to_string(),
            "authorization backend unavailable during check: connection refused"
        );

        let cached = CacheError::BackendUnavailable {
            operation: "check",
            cached: true,
            source: anyhow::anyhow!("connection refused"),
        };
        assert!(matches!(
            cached,
            CacheError::BackendUnavailable { cached: true, .. }
        ));
        assert!(cached.is_backend_unavailable());
    }

    #[test]
    fn test_flush_failure_reports_counts() {
        let err = CacheError::FlushFailure {
            writes: 2,
            deletes: 1,
            source: anyhow::anyhow!("timeout"),
        };
        assert!(err.to_string().contains("2 writes, 1 deletes"));
        assert!(!err.is_backend_unavailable());
    }
}
