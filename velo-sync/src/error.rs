//! Error types for velo-sync

use crate::types::{SourceId, SyncJobType};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Sync engine errors
///
/// `Clone` so one execution's outcome can be fanned out to every coordinator
/// waiter; variants therefore carry owned strings rather than error sources.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Retryable network failure (timeout, 5xx)
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Non-retryable request failure (non-429 4xx)
    #[error("Permanent request error (status {status}): {message}")]
    Permanent { status: u16, message: String },

    /// Provider budget exhausted; the caller reschedules, never retries now
    #[error("Rate limit exceeded for source {source_id}")]
    RateLimitExceeded { source_id: SourceId },

    /// Every provider snapshot for the entity failed
    #[error("No source available for {entity}")]
    NoSourceAvailable { entity: String },

    /// A run exceeded max_run_duration and was force-released
    #[error("Stale lease for {job}: run exceeded {max_secs}s and was force-released")]
    StaleLease { job: SyncJobType, max_secs: u64 },

    /// Invalid configuration (rejected at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal engine error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// API error type for the status/trigger surface
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Sync engine error surfaced through the API
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Sync(err) => {
                let status = match &err {
                    SyncError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                    SyncError::NoSourceAvailable { .. } => StatusCode::BAD_GATEWAY,
                    SyncError::StaleLease { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, "SYNC_ERROR", err.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
