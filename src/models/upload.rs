//! Request and response bodies of the upload API, plus the values the
//! commit protocol produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::session::SessionStatus;

/// Body of `POST /uploads`.
#[derive(Debug, Deserialize)]
pub struct CreateUploadRequest {
    pub content_type: String,
    pub total_size: u64,
    pub part_size: u64,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateUploadResponse {
    pub session_id: Uuid,
    pub part_size: u64,
    pub expected_part_count: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartResponse {
    pub index: u32,
    pub etag: String,
    pub size: u64,
    pub digest: String,
}

/// Optional body of `POST /uploads/{id}/complete`.
#[derive(Debug, Default, Deserialize)]
pub struct CompleteUploadRequest {
    pub declared_digest: Option<String>,
    /// Lifetime of the returned link; the configured default when absent.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub object_key: String,
    pub digest: String,
    pub size: u64,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Body of `GET /uploads/{id}`, used by clients resuming an upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub expected_part_count: u32,
    pub received_parts: Vec<u32>,
    pub missing_parts: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitResult {
    pub object_key: String,
    pub final_digest: String,
    pub total_size: u64,
    pub completed_at: DateTime<Utc>,
}

/// A time-limited retrieval link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grant {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}
