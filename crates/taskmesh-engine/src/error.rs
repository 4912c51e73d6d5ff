//! Engine error taxonomy.
//!
//! [`EngineError`] is what every public engine operation returns. Each
//! variant maps to a stable machine [`ErrorCode`], an HTTP status for
//! the edge, and a retryability verdict: version conflicts and
//! breaker-open failures are always retryable, validation and not-found
//! never are.

use serde::Serialize;
use thiserror::Error;

use taskmesh_kernel::KernelError;
use taskmesh_store::StoreError;

/// Alias for `Result<T, EngineError>`.
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable machine-readable error codes for client-side handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "RESOURCE_001")]
    NotFound,
    #[serde(rename = "RESOURCE_002")]
    Conflict,
    #[serde(rename = "RESOURCE_003")]
    AlreadyExists,
    #[serde(rename = "RESOURCE_004")]
    VersionConflict,
    #[serde(rename = "DATA_025")]
    CycleDetected,
    #[serde(rename = "VALIDATION_001")]
    ValidationFailed,
    #[serde(rename = "SERVICE_001")]
    ServiceUnavailable,
    #[serde(rename = "SERVICE_002")]
    CacheError,
    #[serde(rename = "SERVICE_003")]
    DatabaseError,
    #[serde(rename = "TASK_005")]
    InvalidTaskState,
    #[serde(rename = "RATE_001")]
    RateLimitExceeded,
    #[serde(rename = "TIMEOUT_001")]
    TimeoutExceeded,
    #[serde(rename = "INTERNAL_001")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "RESOURCE_001",
            Self::Conflict => "RESOURCE_002",
            Self::AlreadyExists => "RESOURCE_003",
            Self::VersionConflict => "RESOURCE_004",
            Self::CycleDetected => "DATA_025",
            Self::ValidationFailed => "VALIDATION_001",
            Self::ServiceUnavailable => "SERVICE_001",
            Self::CacheError => "SERVICE_002",
            Self::DatabaseError => "SERVICE_003",
            Self::InvalidTaskState => "TASK_005",
            Self::RateLimitExceeded => "RATE_001",
            Self::TimeoutExceeded => "TIMEOUT_001",
            Self::Internal => "INTERNAL_001",
        }
    }
}

/// Typed errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{resource} {id} was modified by another process; refresh and retry")]
    VersionConflict { resource: &'static str, id: String },

    #[error("{resource} already exists: {detail}")]
    AlreadyExists { resource: &'static str, detail: String },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("cache unavailable; retry after {retry_after_secs}s")]
    CacheUnavailable { retry_after_secs: u64 },

    #[error("database error: {message}")]
    Database { message: String },

    #[error("rate limit exceeded; retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("service saturated ({utilization_percent:.1}% pool utilization)")]
    Backpressure { utilization_percent: f64 },

    #[error("operation timed out: {message}")]
    Timeout { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::VersionConflict { .. } => ErrorCode::VersionConflict,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
            Self::Validation { .. } => ErrorCode::ValidationFailed,
            Self::InvalidState { .. } => ErrorCode::InvalidTaskState,
            Self::CacheUnavailable { .. } => ErrorCode::CacheError,
            Self::Database { .. } => ErrorCode::DatabaseError,
            Self::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Self::Backpressure { .. } => ErrorCode::ServiceUnavailable,
            Self::Timeout { .. } => ErrorCode::TimeoutExceeded,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// HTTP status the edge should translate this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::VersionConflict { .. } | Self::AlreadyExists { .. } => 409,
            Self::CycleDetected { .. } | Self::Validation { .. } | Self::InvalidState { .. } => 400,
            Self::CacheUnavailable { .. } | Self::Backpressure { .. } => 503,
            Self::Database { .. } | Self::Internal { .. } => 500,
            Self::RateLimited { .. } => 429,
            Self::Timeout { .. } => 504,
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::CacheUnavailable { .. }
                | Self::Database { .. }
                | Self::RateLimited { .. }
                | Self::Backpressure { .. }
                | Self::Timeout { .. }
        )
    }

    /// Suggested retry delay, for retryable errors.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::VersionConflict { .. } => Some(1),
            Self::CacheUnavailable { retry_after_secs } => Some(*retry_after_secs),
            Self::Database { .. } => Some(3),
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Backpressure { .. } => Some(5),
            Self::Timeout { .. } => Some(10),
            _ => None,
        }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { resource: entity, id },
            StoreError::VersionConflict { entity, id, .. } => {
                Self::VersionConflict { resource: entity, id }
            }
            StoreError::InvalidState { reason, .. } => Self::InvalidState { message: reason },
            StoreError::InvalidArgument(message) => Self::Validation { message },
            other => Self::Database {
                message: other.to_string(),
            },
        }
    }
}

impl From<KernelError> for EngineError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::BreakerOpen {
                retry_after_secs, ..
            } => Self::CacheUnavailable {
                retry_after_secs: retry_after_secs.ceil() as u64,
            },
            KernelError::RateLimited {
                retry_after_secs, ..
            } => Self::RateLimited { retry_after_secs },
            KernelError::Backpressure {
                utilization_percent,
            } => Self::Backpressure {
                utilization_percent,
            },
            KernelError::Cache(message) => {
                tracing::debug!(%message, "cache failure surfaced as retryable");
                Self::CacheUnavailable { retry_after_secs: 5 }
            }
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
