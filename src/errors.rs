use crate::services::file_service::ShareError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Shortcut for 429 Too Many Requests
    pub fn too_many_requests(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Maps core failures onto client-facing responses. Internal causes are
/// logged here and never reach the response body.
impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::Validation(msg) => AppError::bad_request(msg),
            ShareError::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "File not found"),
            ShareError::Expired(_) => AppError::new(
                StatusCode::GONE,
                "File has expired and is no longer available",
            ),
            ShareError::Retrieval { code, source } => {
                tracing::error!(%code, error = %source, "blob retrieval failed");
                AppError::internal("Failed to retrieve file")
            }
            other => {
                tracing::error!(error = %other, "request failed");
                AppError::internal("Internal server error")
            }
        }
    }
}
