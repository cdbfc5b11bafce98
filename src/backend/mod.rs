//! Object storage backend capability.
//!
//! The gateway only ever talks to storage through [`ObjectBackend`]. The
//! shipped implementation is [`local::LocalBackend`] (disk + SQLite).

pub mod local;
#[cfg(test)]
pub mod mock;

use crate::models::{metadata::ObjectMetadata, object::StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::{io, pin::Pin, time::Duration};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Failure reported by a backend call, classified for retry decisions.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network blips, throttling, timeouts. Safe to retry.
    #[error("transient backend failure: {0}")]
    Transient(String),
    /// Anything a retry cannot fix.
    #[error("backend failure: {0}")]
    Fatal(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Signature or expiry check failed.
    #[error("denied: {0}")]
    Denied(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Self::Transient(err.to_string())
            }
            _ => Self::Fatal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Transient(err.to_string()),
            other => Self::Fatal(other.to_string()),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Streaming reader over a stored object's bytes.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Result of one readiness probe.
#[derive(Debug, Clone, Serialize)]
pub struct CheckStatus {
    pub name: &'static str,
    pub ok: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Start a multipart upload for `key` and return its handle.
    async fn create_multipart(&self, key: &str, content_type: &str) -> BackendResult<String>;

    /// Store one part and return its etag. Writing the same index again
    /// replaces the stored bytes.
    async fn put_part(&self, upload_id: &str, index: u32, bytes: Bytes) -> BackendResult<String>;

    /// Assemble the parts, given as `(index, etag)` in index order.
    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[(u32, String)],
        metadata: &ObjectMetadata,
    ) -> BackendResult<StoredObject>;

    /// Discard a multipart upload. Unknown handles are `NotFound`.
    async fn abort_multipart(&self, upload_id: &str) -> BackendResult<()>;

    /// Produce a retrieval URL for `key` valid for `ttl`.
    async fn sign_url(&self, key: &str, ttl: Duration) -> BackendResult<String>;

    /// Check a signature previously produced by `sign_url`.
    async fn verify_signature(&self, key: &str, expires: i64, signature: &str)
    -> BackendResult<()>;

    /// Open a committed object for streaming.
    async fn open_object(&self, key: &str) -> BackendResult<(StoredObject, ObjectReader)>;

    async fn health(&self) -> Vec<CheckStatus>;
}

/// Run a backend call with an upper bound on its duration. Elapsing is
/// reported as a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, op: &str, fut: F) -> BackendResult<T>
where
    F: Future<Output = BackendResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Transient(format!(
            "{} timed out after {:?}",
            op, limit
        ))),
    }
}
