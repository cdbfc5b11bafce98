//! Failure kinds surfaced by the upload pipeline.

use crate::backend::BackendError;
use crate::services::session::SessionStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error("content type `{0}` is not allowed")]
    UnsupportedType(String),
    #[error("part index {index} is outside [0, {expected})")]
    OutOfRange { index: u32, expected: u32 },
    #[error("malformed digest `{0}`: expected 64 hex characters")]
    InvalidDigest(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session `{id}` is {status}, not open")]
    SessionNotOpen { id: Uuid, status: SessionStatus },
    #[error("upload session `{0}` not found")]
    NotFound(String),
    #[error("part {index} was already received with different content")]
    DigestConflict { index: u32 },
    #[error("upload is missing parts {missing:?}")]
    IncompleteParts { missing: Vec<u32> },
    #[error("digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: String, computed: String },
    #[error("commit failed after retries: {0}")]
    CommitFailed(String),
    #[error("part upload failed after retries: {0}")]
    UploadFailed(String),
    #[error("ttl of {requested}s is outside (0, {max}]s")]
    InvalidTtl { requested: u64, max: u64 },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("access denied: {0}")]
    GrantRejected(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type UploadResult<T> = Result<T, UploadError>;
