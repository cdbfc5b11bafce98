//! Represents a committed object as recorded by the storage backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A fully assembled object produced by a multipart commit.
///
/// Holds the object's metadata only; the payload lives with the backend.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct StoredObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key (path-like, e.g. `uploads/2026/10/17/<id>.png`).
    pub key: String,

    /// Original filename supplied by the client, if any.
    pub filename: Option<String>,

    /// Content type (MIME type) declared when the session was opened.
    pub content_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Multipart-style MD5 etag (`<md5-of-part-md5s>-<parts>`).
    pub etag: String,

    /// SHA-256 upload digest verified at commit.
    pub content_digest: String,

    /// Identity that opened the upload session.
    pub owner: String,

    /// Client address recorded when the session was opened, if known.
    pub uploader_ip: Option<String>,

    /// Timestamp when the commit completed.
    pub uploaded_at: DateTime<Utc>,
}
