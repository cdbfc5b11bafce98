//! Drives part writes, multipart commit and abort against the backend.
//!
//! Backend calls are bounded by a timeout and transient failures are retried
//! with exponential backoff. A commit holds the session lock from the
//! coverage check until the session is `Committed` or back to `Open`, so an
//! abort or expiry can never interleave with it.

use crate::backend::{BackendError, BackendResult, ObjectBackend, with_timeout};
use crate::models::{metadata::ObjectMetadata, upload::CommitResult};
use crate::services::{
    digest::PartDigest,
    error::{UploadError, UploadResult},
    registry::{SessionRegistry, release},
    session::{PartRecord, Reservation, SessionId, SessionStatus, UploadSession},
};
use bytes::Bytes;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for a single backend call.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match with_timeout(self.timeout, op, call()).await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(op, attempt, ?delay, "transient backend failure, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

pub struct CommitCoordinator {
    backend: Arc<dyn ObjectBackend>,
    registry: SessionRegistry,
    retry: RetryPolicy,
}

impl CommitCoordinator {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        registry: SessionRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            registry,
            retry,
        }
    }

    /// Lock a live session, expiring it first when its deadline has passed.
    pub async fn live(&self, id: &SessionId) -> UploadResult<OwnedMutexGuard<UploadSession>> {
        self.registry
            .lock_unexpired(id, self.backend.as_ref(), self.retry.timeout, Utc::now())
            .await
    }

    /// Snapshot of a live session.
    pub async fn snapshot(&self, id: &SessionId) -> UploadResult<UploadSession> {
        let session = self.live(id).await?;
        Ok(session.clone())
    }

    /// Write a validated part and record it on the session.
    ///
    /// Identical content for an already recorded index returns the existing
    /// record without touching the backend.
    pub async fn upload_part(
        &self,
        id: SessionId,
        index: u32,
        bytes: Bytes,
        digest: PartDigest,
    ) -> UploadResult<PartRecord> {
        let reservation = self.live(&id).await?.reserve_part(index, digest)?;
        let upload_id = match reservation {
            Reservation::Existing(record) => return Ok(record),
            Reservation::Reserved { backend_upload_id } => backend_upload_id,
        };

        let size = bytes.len() as u64;
        let put = self
            .retry
            .run("put_part", || {
                self.backend.put_part(&upload_id, index, bytes.clone())
            })
            .await;

        let etag = match put {
            Ok(etag) => etag,
            Err(err) => {
                // the session may be gone already; nothing left to release then
                let _ = self
                    .registry
                    .mutate(&id, |s| {
                        s.release_part(index);
                        Ok(())
                    })
                    .await;
                warn!(session_id = %id, index, "part upload failed: {}", err);
                return Err(match err {
                    BackendError::Transient(msg) => UploadError::UploadFailed(msg),
                    BackendError::NotFound(_) => UploadError::NotFound(id.to_string()),
                    other => UploadError::Backend(other),
                });
            }
        };

        // the deadline may have passed while the bytes were in transit
        let mut session = self.live(&id).await?;
        session.release_part(index);
        session.record_part(PartRecord {
            index,
            size,
            etag,
            digest,
        })
    }

    /// Verify coverage and digest, then commit the upload on the backend.
    ///
    /// `prepare` receives the object key once verification has passed and
    /// before anything is committed. If it fails the session stays open and
    /// the backend is not touched.
    pub async fn finalize<T, F, Fut>(
        &self,
        id: SessionId,
        declared: Option<PartDigest>,
        prepare: F,
    ) -> UploadResult<(CommitResult, T)>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        let mut session = self.live(&id).await?;
        session.ensure_open()?;

        let missing = session.missing_parts();
        if !missing.is_empty() {
            return Err(UploadError::IncompleteParts { missing });
        }
        let computed = session.digest.finalize(session.expected_part_count)?;

        if let Some(declared) = declared.filter(|d| *d != computed) {
            session.transition(SessionStatus::Aborted)?;
            release(self.backend.as_ref(), self.retry.timeout, &session).await;
            drop(session);
            self.registry.remove(&id).await;
            warn!(session_id = %id, %declared, %computed, "digest mismatch, upload aborted");
            return Err(UploadError::DigestMismatch {
                declared: declared.to_hex(),
                computed: computed.to_hex(),
            });
        }

        let prepared = prepare(session.object_key.clone()).await?;

        session.transition(SessionStatus::Completing)?;
        let metadata = ObjectMetadata {
            filename: session.filename.clone(),
            content_type: session.content_type.clone(),
            size_bytes: session.total_size,
            owner: session.owner.clone(),
            uploader_ip: session.uploader_ip.clone(),
            content_digest: computed.to_hex(),
        };
        let parts = session.ordered_etags();
        let upload_id = session.backend_upload_id.clone();
        let key = session.object_key.clone();

        let committed = self
            .retry
            .run("complete_multipart", || {
                self.backend
                    .complete_multipart(&upload_id, &key, &parts, &metadata)
            })
            .await;

        match committed {
            Ok(object) => {
                session.transition(SessionStatus::Committed)?;
                drop(session);
                self.registry.remove(&id).await;
                info!(
                    session_id = %id,
                    key = %object.key,
                    size = object.size_bytes,
                    "upload committed"
                );
                let result = CommitResult {
                    object_key: object.key,
                    final_digest: computed.to_hex(),
                    total_size: object.size_bytes as u64,
                    completed_at: Utc::now(),
                };
                Ok((result, prepared))
            }
            Err(BackendError::NotFound(what)) => {
                // staged parts are gone, a retry could never succeed
                session.transition(SessionStatus::Aborted)?;
                drop(session);
                self.registry.remove(&id).await;
                warn!(session_id = %id, "backend lost the upload, session aborted: {}", what);
                Err(UploadError::CommitFailed(format!(
                    "backend upload {} no longer exists",
                    upload_id
                )))
            }
            Err(err) => {
                session.transition(SessionStatus::Open)?;
                warn!(session_id = %id, "commit failed, session reopened: {}", err);
                Err(match err {
                    BackendError::Transient(msg) => UploadError::CommitFailed(msg),
                    other => UploadError::Backend(other),
                })
            }
        }
    }

    /// Abort a live session. Backend cleanup is best-effort.
    pub async fn abort(&self, id: SessionId) -> UploadResult<()> {
        let mut session = self.live(&id).await?;
        session.transition(SessionStatus::Aborted)?;
        release(self.backend.as_ref(), self.retry.timeout, &session).await;
        drop(session);
        self.registry.remove(&id).await;
        info!(session_id = %id, "upload aborted");
        Ok(())
    }
}
