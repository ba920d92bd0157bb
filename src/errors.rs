use crate::services::error::BlobError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by HTTP handlers, rendered as
/// `{"error": .., "code": .., "status": ..}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", msg)
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
        if self.status.is_server_error() {
            tracing::error!("{} ({}): {}", self.status, self.code, self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let status = match &err {
            BlobError::NotFound(_) | BlobError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
            BlobError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            BlobError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BlobError::UnsupportedOperator { .. }
            | BlobError::InvalidQueryValue { .. }
            | BlobError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            BlobError::BackendWriteFailed(_)
            | BlobError::BackendReadFailed(_)
            | BlobError::Index(_)
            | BlobError::RollbackFailed { .. }
            | BlobError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.code(), err.to_string())
    }
}
