//! In-memory registry of live upload sessions.
//!
//! The map is guarded by a `RwLock` that is only held long enough to look up
//! or insert an entry; each session carries its own `Mutex`, so mutations of
//! one session are linearized while different sessions proceed in parallel.
//! Sessions are removed from the map as soon as they reach a terminal state.

use crate::backend::{BackendError, ObjectBackend, with_timeout};
use crate::services::{
    error::{UploadError, UploadResult},
    session::{SessionId, SessionStatus, UploadSession},
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

type SessionHandle = Arc<Mutex<UploadSession>>;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened session.
    pub async fn create(&self, session: UploadSession) -> SessionId {
        let id = session.id;
        let mut w = self.sessions.write().await;
        w.insert(id, Arc::new(Mutex::new(session)));
        id
    }

    async fn handle(&self, id: &SessionId) -> UploadResult<SessionHandle> {
        let r = self.sessions.read().await;
        r.get(id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Snapshot of a session.
    pub async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        let handle = self.handle(id).await?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    /// Exclusive access to a live session, held across backend calls.
    ///
    /// A session that turned terminal while the caller waited for the lock
    /// is reported as `NotFound`.
    pub async fn lock(&self, id: &SessionId) -> UploadResult<OwnedMutexGuard<UploadSession>> {
        let handle = self.handle(id).await?;
        let guard = handle.lock_owned().await;
        if guard.status.is_terminal() {
            return Err(UploadError::NotFound(id.to_string()));
        }
        Ok(guard)
    }

    /// Like [`lock`](Self::lock), but an open session whose deadline is at
    /// or before `now` is expired on the spot, its backend upload released,
    /// and reported as `NotFound`.
    pub async fn lock_unexpired(
        &self,
        id: &SessionId,
        backend: &dyn ObjectBackend,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> UploadResult<OwnedMutexGuard<UploadSession>> {
        let mut session = self.lock(id).await?;
        if session.status != SessionStatus::Open || !session.is_expired(now) {
            return Ok(session);
        }
        session.transition(SessionStatus::Expired)?;
        release(backend, timeout, &session).await;
        drop(session);
        self.remove(id).await;
        info!(session_id = %id, "session expired");
        Err(UploadError::NotFound(id.to_string()))
    }

    /// Apply `f` to a live session under its lock.
    ///
    /// If `f` leaves the session terminal it is dropped from the registry.
    pub async fn mutate<R, F>(&self, id: &SessionId, f: F) -> UploadResult<R>
    where
        F: FnOnce(&mut UploadSession) -> UploadResult<R>,
    {
        let mut guard = self.lock(id).await?;
        let result = f(&mut *guard);
        if guard.status.is_terminal() {
            self.remove(id).await;
        }
        result
    }

    pub async fn remove(&self, id: &SessionId) {
        let mut w = self.sessions.write().await;
        w.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn handles(&self) -> Vec<(SessionId, SessionHandle)> {
        let r = self.sessions.read().await;
        r.iter().map(|(id, h)| (*id, h.clone())).collect()
    }

    /// Expire every open session whose deadline is at or before `now`,
    /// releasing its multipart upload on the backend.
    ///
    /// Each session is locked first, so a sweep never interleaves with a
    /// commit in progress.
    pub async fn sweep_expired(
        &self,
        backend: &dyn ObjectBackend,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let mut expired = 0;
        for (id, handle) in self.handles().await {
            let mut session = handle.lock().await;
            if session.status != SessionStatus::Open || !session.is_expired(now) {
                continue;
            }
            if let Err(err) = session.transition(SessionStatus::Expired) {
                warn!(session_id = %id, "cannot expire session: {}", err);
                continue;
            }
            release(backend, timeout, &session).await;
            drop(session);
            self.remove(&id).await;
            info!(session_id = %id, "session expired");
            expired += 1;
        }
        expired
    }

    /// Abort every live session. Used at shutdown.
    pub async fn drain(&self, backend: &dyn ObjectBackend, timeout: Duration) -> usize {
        let mut drained = 0;
        for (id, handle) in self.handles().await {
            let mut session = handle.lock().await;
            if session.status.is_terminal() {
                continue;
            }
            if session.transition(SessionStatus::Aborted).is_ok() {
                release(backend, timeout, &session).await;
                drained += 1;
            }
            drop(session);
            self.remove(&id).await;
        }
        drained
    }
}

/// Best-effort abort of a session's backend upload.
pub(crate) async fn release(
    backend: &dyn ObjectBackend,
    timeout: Duration,
    session: &UploadSession,
) {
    let upload_id = &session.backend_upload_id;
    match with_timeout(timeout, "abort_multipart", backend.abort_multipart(upload_id)).await {
        Ok(()) => debug!(session_id = %session.id, %upload_id, "backend upload released"),
        Err(BackendError::NotFound(_)) => {
            debug!(session_id = %session.id, %upload_id, "backend upload already gone")
        }
        Err(err) => warn!(
            session_id = %session.id,
            %upload_id,
            "failed to release backend upload: {}",
            err
        ),
    }
}
