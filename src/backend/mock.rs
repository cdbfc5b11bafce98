//! In-memory backend with fault injection, used by the service tests.

use crate::backend::{BackendError, BackendResult, CheckStatus, ObjectBackend, ObjectReader};
use crate::models::{metadata::ObjectMetadata, object::StoredObject};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

#[derive(Default)]
pub struct MockState {
    pub uploads: HashMap<String, BTreeMap<u32, Bytes>>,
    pub objects: HashMap<String, (StoredObject, Bytes)>,
    pub aborted: Vec<String>,
    pub put_calls: u32,
    pub complete_calls: u32,
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    transient_puts: AtomicU32,
    transient_completes: AtomicU32,
    fatal_completes: AtomicBool,
    failing_signs: AtomicBool,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` `put_part` calls fail transiently.
    pub fn fail_next_puts(&self, n: u32) {
        self.transient_puts.store(n, Ordering::SeqCst);
    }

    /// The next `n` `complete_multipart` calls fail transiently.
    pub fn fail_next_completes(&self, n: u32) {
        self.transient_completes.store(n, Ordering::SeqCst);
    }

    pub fn fail_completes_fatally(&self, fatal: bool) {
        self.fatal_completes.store(fatal, Ordering::SeqCst);
    }

    pub fn fail_signing(&self, fail: bool) {
        self.failing_signs.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|(_, b)| b.clone())
    }
}

#[async_trait]
impl ObjectBackend for MockBackend {
    async fn create_multipart(&self, _key: &str, _content_type: &str) -> BackendResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.state().uploads.insert(id.clone(), BTreeMap::new());
        Ok(id)
    }

    async fn put_part(&self, upload_id: &str, index: u32, bytes: Bytes) -> BackendResult<String> {
        let mut state = self.state();
        state.put_calls += 1;
        if take_failure(&self.transient_puts) {
            return Err(BackendError::Transient("injected put failure".into()));
        }
        let etag = format!("{:x}", md5::compute(&bytes));
        state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NotFound(upload_id.to_string()))?
            .insert(index, bytes);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[(u32, String)],
        metadata: &ObjectMetadata,
    ) -> BackendResult<StoredObject> {
        let mut state = self.state();
        state.complete_calls += 1;
        if take_failure(&self.transient_completes) {
            return Err(BackendError::Transient("injected complete failure".into()));
        }
        if self.fatal_completes.load(Ordering::SeqCst) {
            return Err(BackendError::Fatal("injected fatal complete".into()));
        }
        let staged = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| BackendError::NotFound(upload_id.to_string()))?;
        let mut body = BytesMut::new();
        for (index, etag) in parts {
            let part = staged
                .get(index)
                .ok_or_else(|| BackendError::Fatal(format!("part {} missing", index)))?;
            if format!("{:x}", md5::compute(part)) != *etag {
                return Err(BackendError::Fatal(format!("etag mismatch for part {}", index)));
            }
            body.extend_from_slice(part);
        }
        let object = StoredObject {
            id: Uuid::new_v4(),
            key: key.to_string(),
            filename: metadata.filename.clone(),
            content_type: metadata.content_type.clone(),
            size_bytes: body.len() as i64,
            etag: format!("mock-{}", parts.len()),
            content_digest: metadata.content_digest.clone(),
            owner: metadata.owner.clone(),
            uploader_ip: metadata.uploader_ip.clone(),
            uploaded_at: Utc::now(),
        };
        state.uploads.remove(upload_id);
        state
            .objects
            .insert(key.to_string(), (object.clone(), body.freeze()));
        Ok(object)
    }

    async fn abort_multipart(&self, upload_id: &str) -> BackendResult<()> {
        let mut state = self.state();
        state.aborted.push(upload_id.to_string());
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(upload_id.to_string()))
    }

    async fn sign_url(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        if self.failing_signs.load(Ordering::SeqCst) {
            return Err(BackendError::Fatal("injected signing failure".into()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("mock://{}?expires={}&signature=ok", key, expires))
    }

    async fn verify_signature(
        &self,
        _key: &str,
        expires: i64,
        signature: &str,
    ) -> BackendResult<()> {
        if signature == "ok" && expires > Utc::now().timestamp() {
            Ok(())
        } else {
            Err(BackendError::Denied("bad mock signature".into()))
        }
    }

    async fn open_object(&self, key: &str) -> BackendResult<(StoredObject, ObjectReader)> {
        let state = self.state();
        let (object, bytes) = state
            .objects
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok((object.clone(), Box::pin(Cursor::new(bytes.to_vec()))))
    }

    async fn health(&self) -> Vec<CheckStatus> {
        vec![CheckStatus {
            name: "mock",
            ok: true,
            error: None,
        }]
    }
}
