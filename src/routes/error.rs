use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::services::queue::QueueError;

/// Error returned by every handler, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Validation(String),

    #[error("Job not found")]
    NotFound,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Queue(QueueError::NotFound | QueueError::UnknownQueue(_)) => StatusCode::NOT_FOUND,
            ApiError::Queue(QueueError::Conflict { .. }) => StatusCode::CONFLICT,
            ApiError::Queue(e) if e.is_infrastructure() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Job queue unavailable".to_string()
        } else {
            self.to_string()
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}
