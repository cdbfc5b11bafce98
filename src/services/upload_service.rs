//! src/services/upload_service.rs
//!
//! UploadService: the entry point handlers call. Opens sessions against the
//! backend, streams part bodies through the validator and hasher, and hands
//! writes, commits and aborts to the `CommitCoordinator`. Cheap to clone; it
//! is the router state.

use crate::backend::{BackendError, CheckStatus, ObjectBackend, ObjectReader, with_timeout};
use crate::models::{
    object::StoredObject,
    upload::{CommitResult, Grant},
};
use crate::services::{
    commit::{CommitCoordinator, RetryPolicy},
    digest::{PartDigest, PartHasher},
    error::{UploadError, UploadResult},
    grants::GrantIssuer,
    registry::SessionRegistry,
    session::{PartRecord, SessionId, SessionSpec, UploadSession},
    validator::{self, UploadLimits},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{io, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Tunables for the upload pipeline.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub limits: UploadLimits,
    /// Lifetime of a session from creation. Activity does not extend it.
    pub session_ttl: Duration,
    pub grant_ttl: Duration,
    pub max_grant_ttl: Duration,
    pub retry: RetryPolicy,
}

#[derive(Clone)]
pub struct UploadService {
    registry: SessionRegistry,
    coordinator: Arc<CommitCoordinator>,
    grants: Arc<GrantIssuer>,
    backend: Arc<dyn ObjectBackend>,
    limits: Arc<UploadLimits>,
    session_ttl: chrono::Duration,
    backend_timeout: Duration,
}

impl UploadService {
    pub fn new(backend: Arc<dyn ObjectBackend>, settings: ServiceSettings) -> Self {
        let registry = SessionRegistry::new();
        let backend_timeout = settings.retry.timeout;
        let coordinator = CommitCoordinator::new(backend.clone(), registry.clone(), settings.retry);
        let grants = GrantIssuer::new(
            backend.clone(),
            settings.grant_ttl,
            settings.max_grant_ttl,
            backend_timeout,
        );
        Self {
            registry,
            coordinator: Arc::new(coordinator),
            grants: Arc::new(grants),
            backend,
            limits: Arc::new(settings.limits),
            session_ttl: chrono::Duration::seconds(settings.session_ttl.as_secs() as i64),
            backend_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Validate the request, start a backend multipart upload and register
    /// the session.
    pub async fn create_session(&self, spec: SessionSpec) -> UploadResult<UploadSession> {
        let expected_part_count = validator::validate_session_spec(&spec, &self.limits)?;
        let id = SessionId::new_v4();
        let now = Utc::now();
        let key = object_key(id, spec.filename.as_deref(), now);

        let backend_upload_id = with_timeout(
            self.backend_timeout,
            "create_multipart",
            self.backend.create_multipart(&key, &spec.content_type),
        )
        .await?;

        let session = UploadSession::new(
            id,
            spec,
            expected_part_count,
            key,
            backend_upload_id,
            now,
            self.session_ttl,
        );
        info!(
            session_id = %id,
            key = %session.object_key,
            parts = expected_part_count,
            "upload session opened"
        );
        self.registry.create(session.clone()).await;
        Ok(session)
    }

    /// Current state of a live session. An overdue session is expired here
    /// rather than waiting for the next sweep.
    pub async fn session(&self, id: SessionId) -> UploadResult<UploadSession> {
        self.coordinator.snapshot(&id).await
    }

    /// Stream a part body in, validate it and store it.
    ///
    /// `content_type` defaults to the session's declared type. When
    /// `declared` is given the received bytes must hash to it.
    pub async fn upload_part<S>(
        &self,
        id: SessionId,
        index: u32,
        content_type: Option<String>,
        declared: Option<PartDigest>,
        stream: S,
    ) -> UploadResult<PartRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let session = self.coordinator.snapshot(&id).await?;
        session.ensure_open()?;
        let content_type = content_type.unwrap_or_else(|| session.content_type.clone());

        let (bytes, digest) = read_part(stream, self.limits.max_part_size).await?;
        validator::validate_part(
            bytes.len() as u64,
            &content_type,
            index,
            &session,
            &self.limits,
        )?;
        if let Some(declared) = declared {
            if declared != digest {
                return Err(UploadError::InvalidPart(format!(
                    "body hashes to {}, header declared {}",
                    digest, declared
                )));
            }
        }
        debug!(session_id = %id, index, size = bytes.len(), "part received");

        // a dropped client connection must not strand the part half-recorded
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.upload_part(id, index, bytes, digest).await })
            .await
            .map_err(|err| UploadError::UploadFailed(format!("part task failed: {}", err)))?
    }

    /// Commit the upload and issue a retrieval link for it.
    ///
    /// The link is signed before the commit, so a signing failure leaves the
    /// session open for a retry instead of stranding an unlinked object.
    pub async fn complete(
        &self,
        id: SessionId,
        declared: Option<PartDigest>,
        ttl: Option<Duration>,
    ) -> UploadResult<(CommitResult, Grant)> {
        let ttl = ttl.unwrap_or(self.grants.default_ttl());
        self.grants.check_ttl(ttl)?;
        let grants = self.grants.clone();
        self.coordinator
            .finalize(id, declared, move |key| async move { grants.issue(&key, ttl).await })
            .await
    }

    pub async fn abort(&self, id: SessionId) -> UploadResult<()> {
        self.coordinator.abort(id).await
    }

    /// Check a signed link and open the object it points at.
    pub async fn open_signed(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> UploadResult<(StoredObject, ObjectReader)> {
        with_timeout(
            self.backend_timeout,
            "verify_signature",
            self.backend.verify_signature(key, expires, signature),
        )
        .await
        .map_err(|err| UploadError::GrantRejected(err.to_string()))?;

        self.backend.open_object(key).await.map_err(|err| match err {
            BackendError::NotFound(_) => UploadError::ObjectNotFound(key.into()),
            other => UploadError::Backend(other),
        })
    }

    pub async fn readiness(&self) -> Vec<CheckStatus> {
        self.backend.health().await
    }

    pub async fn sweep_expired(&self) -> usize {
        self.registry
            .sweep_expired(self.backend.as_ref(), self.backend_timeout, Utc::now())
            .await
    }

    /// Abort all live sessions. Called once the server stops accepting
    /// requests.
    pub async fn drain(&self) -> usize {
        self.registry
            .drain(self.backend.as_ref(), self.backend_timeout)
            .await
    }
}

/// Collect a part body, hashing as it streams. Bodies over `limit` are
/// rejected without being buffered further.
async fn read_part<S>(stream: S, limit: u64) -> UploadResult<(Bytes, PartDigest)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut hasher = PartHasher::new();
    let mut buf = BytesMut::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| UploadError::InvalidPart(format!("failed to read body: {}", err)))?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(UploadError::InvalidPart(format!(
                "part exceeds the {} byte limit",
                limit
            )));
        }
        hasher.update(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), hasher.finish()))
}

/// `uploads/{yyyy}/{mm}/{dd}/{session}{.ext}`, keeping the client's file
/// extension when it is short and alphanumeric.
pub fn object_key(id: SessionId, filename: Option<&str>, now: DateTime<Utc>) -> String {
    let extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 16)
        .filter(|ext| ext.bytes().all(|b| b.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    format!(
        "uploads/{}/{}{}",
        now.format("%Y/%m/%d"),
        id.simple(),
        extension
    )
}
