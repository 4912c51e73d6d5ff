//! Error types for the taskmesh-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Version conflicts from optimistic concurrency surface as their own
//! variant so callers can distinguish "retry with fresh state" from
//! genuine failures.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The row was modified by another writer since it was read.
    ///
    /// Retryable: the caller should re-read and re-apply its change.
    #[error("{entity} {id} was modified concurrently (expected version {expected})")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },

    /// A state transition was requested that the entity's lifecycle
    /// does not allow (e.g. cancelling a completed task).
    #[error("invalid {entity} state: {reason}")]
    InvalidState { entity: &'static str, reason: String },

    /// An invalid argument was provided to a store operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored enum column held a value this build does not know.
    #[error("unknown {what} value in database: {value}")]
    UnknownEnumValue { what: &'static str, value: String },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
