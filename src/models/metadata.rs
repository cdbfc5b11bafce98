//! Metadata handed to the backend alongside a multipart commit.

use serde::Serialize;

/// Descriptive attributes stored with a committed object.
#[derive(Serialize, Clone, Debug)]
pub struct ObjectMetadata {
    /// Original filename of the upload, when the client sent one.
    pub filename: Option<String>,

    /// MIME type declared at session creation.
    pub content_type: String,

    /// Total size in bytes.
    pub size_bytes: u64,

    /// Identity that opened the session.
    pub owner: String,

    /// Address of the client that opened the session.
    pub uploader_ip: Option<String>,

    /// Hex SHA-256 upload digest.
    pub content_digest: String,
}
