//! Error envelope translation.
//!
//! Every engine error leaves the edge as the same JSON shape:
//!
//! ```json
//! {"status": "error", "error_code": "RESOURCE_001", "message": "...",
//!  "retryable": false}
//! ```
//!
//! with `retry_after` attached to retryable failures. Internal errors
//! keep their detail in the server log and surface a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use taskmesh_engine::EngineError;

/// The wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub status: &'static str,
    pub error_code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Axum-compatible wrapper around [`EngineError`].
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl From<taskmesh_kernel::KernelError> for ApiError {
    fn from(err: taskmesh_kernel::KernelError) -> Self {
        Self(EngineError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = match &err {
            EngineError::Internal { message } => {
                tracing::error!(%message, "internal error surfaced to client");
                "internal server error".to_string()
            }
            EngineError::Database { message } => {
                tracing::error!(%message, "database error surfaced to client");
                "database operation failed".to_string()
            }
            other => other.to_string(),
        };

        let envelope = ErrorEnvelope {
            status: "error",
            error_code: err.error_code().as_str(),
            message,
            details: match &err {
                EngineError::CycleDetected { path } => {
                    Some(serde_json::json!({"cycle_path": path}))
                }
                EngineError::NotFound { resource, id } => {
                    Some(serde_json::json!({"resource": resource, "identifier": id}))
                }
                _ => None,
            },
            retryable: err.is_retryable(),
            retry_after: err.retry_after_secs(),
        };

        (status, Json(envelope)).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = Result<T, ApiError>;

// ── tests ────────────────────────────────────────────────────────────
