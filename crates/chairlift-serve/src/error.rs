//! API error types and response formatting.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use chairlift_ingest::PublishError;

/// Seconds a client should wait before retrying after pool exhaustion.
const RETRY_AFTER_SECS: &str = "1";

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid path parameter or request body.
    #[error("bad request: {0}")]
    BadRequest(#[from] chairlift_core::Error),

    /// The event couldn't be published.
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            Self::BadRequest(err) => (StatusCode::BAD_REQUEST, "bad_request", Some(err.to_string())),
            Self::Publish(err) if err.is_exhausted() => {
                tracing::warn!(error = %err, "publish channels exhausted");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "unavailable",
                    Some("Service is at capacity, retry shortly".to_string()),
                )
            }
            Self::Publish(err) => {
                tracing::error!(error = %err, "publish failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "publish_error",
                    Some("The ride could not be queued".to_string()),
                )
            }
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    Some("An internal error occurred".to_string()),
                )
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            message,
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}
