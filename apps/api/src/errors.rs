use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error type for the HTTP surface.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Time-series error: {0}")]
    TimeSeries(#[from] clickhouse::error::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No embedding instance available")]
    NoInstances,

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Serializes the error, attaching the underlying message as
    /// `debug_error` when debug mode is on.
    pub fn into_response_with_debug(self, debug: bool) -> Response {
        let (status, message) = self.parts();
        let mut body = json!({ "error": message });
        if debug {
            body["debug_error"] = json!(self.to_string());
        }
        (status, Json(body)).into_response()
    }

    fn parts(&self) -> (StatusCode, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::TimeSeries(e) => {
                tracing::error!("Time-series error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Storage(msg) => {
                tracing::error!("Storage error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A storage error occurred".to_string(),
                )
            }
            AppError::NoInstances => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No embedding instance available".to_string(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with_debug(false)
    }
}

/// What a queue consumer should do with a message after handling it.
///
/// Workers never bubble errors up to the consume loop; every error class
/// maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Side effects are durably applied (or the message is a no-op).
    Ack,
    /// Transient failure; redelivery is expected to succeed.
    Requeue,
    /// Poisonous message (bad JSON, schema violation); ack and drop.
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = AppError::NotFound("README not found".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_no_instances_maps_to_503() {
        let resp = AppError::NoInstances.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
