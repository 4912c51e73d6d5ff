//! Kernel error types.
//!
//! All infrastructure subsystems surface errors through [`KernelError`].
//! Variants carry enough context for callers to decide between retrying
//! (breaker open, backpressure, rate limited, all transient) and
//! failing outright.

use thiserror::Error;

/// Alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;

/// Unified error type for the taskmesh infrastructure layer.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A circuit breaker is open; the dependency is being isolated.
    /// Retry after `retry_after_secs`.
    #[error("circuit breaker '{name}' is open; retry after {retry_after_secs:.1}s")]
    BreakerOpen { name: String, retry_after_secs: f64 },

    /// The caller exceeded a rate limit for this scope.
    #[error("rate limit exceeded for {scope}; retry after {retry_after_secs}s")]
    RateLimited { scope: String, retry_after_secs: u64 },

    /// Shared resource pools are saturated; writes are being shed.
    #[error("resource pools at capacity ({utilization_percent:.1}% utilized)")]
    Backpressure { utilization_percent: f64 },

    /// The cache/queue backend failed an operation.
    #[error("cache backend error: {0}")]
    Cache(String),

    /// Subscribing to an event channel failed.
    #[error("subscribe failed for channel {channel}: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Catch-all for unexpected internal failures.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Whether the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BreakerOpen { .. }
                | Self::RateLimited { .. }
                | Self::Backpressure { .. }
                | Self::Cache(_)
        )
    }
}
