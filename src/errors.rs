use crate::backend::BackendError;
use crate::services::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// HTTP-facing error: a status, a stable machine-readable code and a message.
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
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let (status, code) = match &err {
            UploadError::InvalidPart(_) => (StatusCode::BAD_REQUEST, "invalid_part"),
            UploadError::UnsupportedType(_) => (StatusCode::BAD_REQUEST, "unsupported_type"),
            UploadError::OutOfRange { .. } => (StatusCode::BAD_REQUEST, "out_of_range"),
            UploadError::InvalidDigest(_) => (StatusCode::BAD_REQUEST, "invalid_digest"),
            UploadError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            UploadError::InvalidTtl { .. } => (StatusCode::BAD_REQUEST, "invalid_ttl"),
            UploadError::NotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            UploadError::ObjectNotFound(_) => (StatusCode::NOT_FOUND, "object_not_found"),
            UploadError::GrantRejected(_) => (StatusCode::FORBIDDEN, "grant_rejected"),
            UploadError::SessionNotOpen { .. } => (StatusCode::CONFLICT, "session_not_open"),
            UploadError::DigestConflict { .. } => (StatusCode::CONFLICT, "digest_conflict"),
            UploadError::IncompleteParts { .. } => (StatusCode::CONFLICT, "incomplete_parts"),
            UploadError::IllegalTransition { .. } => {
                (StatusCode::CONFLICT, "illegal_transition")
            }
            UploadError::DigestMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "digest_mismatch")
            }
            UploadError::CommitFailed(_) => (StatusCode::BAD_GATEWAY, "commit_failed"),
            UploadError::UploadFailed(_) => (StatusCode::BAD_GATEWAY, "upload_failed"),
            UploadError::Backend(BackendError::Denied(_)) => {
                (StatusCode::FORBIDDEN, "grant_rejected")
            }
            UploadError::Backend(BackendError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "object_not_found")
            }
            UploadError::Backend(_) => (StatusCode::BAD_GATEWAY, "backend_error"),
        };
        AppError::new(status, code, err.to_string())
    }
}
