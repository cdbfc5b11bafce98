//! src/backend/local.rs
//!
//! LocalBackend: multipart storage on local disk with object metadata in
//! SQLite. Parts are staged beneath `base_path/.multipart/{upload_id}/` and
//! assembled on commit into `base_path/{shard}/{shard}/{key}`.

use crate::backend::{BackendError, BackendResult, CheckStatus, ObjectBackend, ObjectReader};
use crate::models::{metadata::ObjectMetadata, object::StoredObject};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::SqlitePool;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");
const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGING_DIR: &str = ".multipart";

#[derive(Clone)]
pub struct LocalBackend {
    /// Shared SQLite connection pool used for object metadata.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where staged parts and objects are stored.
    pub base_path: PathBuf,

    /// Externally reachable origin used when building signed URLs.
    public_base_url: String,

    signing_key: Vec<u8>,
}

impl LocalBackend {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        signing_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.into(),
        }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> BackendResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> BackendResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(BackendError::Fatal(format!("invalid object key `{}`", key)));
        }
        Ok(())
    }

    /// Handles are generated by `create_multipart`; anything else is unknown.
    fn staging_dir(&self, upload_id: &str) -> BackendResult<PathBuf> {
        if upload_id.is_empty()
            || upload_id.len() > 64
            || !upload_id.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(BackendError::NotFound(format!("upload `{}`", upload_id)));
        }
        Ok(self.base_path.join(STAGING_DIR).join(upload_id))
    }

    fn part_path(staging: &Path, index: u32) -> PathBuf {
        staging.join(format!("{:05}.part", index))
    }

    async fn ensure_staging_exists(&self, upload_id: &str) -> BackendResult<PathBuf> {
        let staging = self.staging_dir(upload_id)?;
        match fs::metadata(&staging).await {
            Ok(meta) if meta.is_dir() => Ok(staging),
            Ok(_) => Err(BackendError::NotFound(format!("upload `{}`", upload_id))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(format!("upload `{}`", upload_id)))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (hex::encode(&digest[..1]), hex::encode(&digest[1..2]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn mac(&self) -> BackendResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|err| BackendError::Fatal(format!("signing key rejected: {}", err)))
    }

    fn signature(&self, key: &str, expires: i64) -> BackendResult<String> {
        let mut mac = self.mac()?;
        mac.update(format!("GET\n{}\n{}", key, expires).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn signed_url(&self, key: &str, expires: i64) -> BackendResult<String> {
        Ok(format!(
            "{}/objects/{}?expires={}&signature={}",
            self.public_base_url,
            key,
            expires,
            self.signature(key, expires)?
        ))
    }

    /// Write `data` to `dest` through a temp file in the same directory.
    async fn write_atomically(dest: &Path, data: &[u8]) -> BackendResult<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| BackendError::Fatal("path missing parent directory".into()))?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, dest).await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Concatenate staged parts into `file`, checking each etag.
    ///
    /// Returns the byte count and the multipart-style etag.
    async fn assemble(
        staging: &Path,
        parts: &[(u32, String)],
        file: &mut File,
    ) -> BackendResult<(u64, String)> {
        let mut size_bytes: u64 = 0;
        let mut etags = md5::Context::new();
        for (index, etag) in parts {
            let data = fs::read(Self::part_path(staging, *index))
                .await
                .map_err(|err| match err.kind() {
                    ErrorKind::NotFound => BackendError::Fatal(format!("part {} missing", index)),
                    _ => err.into(),
                })?;
            let digest = md5::compute(&data);
            if format!("{:x}", digest) != *etag {
                return Err(BackendError::Fatal(format!(
                    "etag mismatch for part {}",
                    index
                )));
            }
            etags.consume(digest.0);
            size_bytes += data.len() as u64;
            file.write_all(&data).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((size_bytes, format!("{:x}-{}", etags.compute(), parts.len())))
    }

    async fn fetch_object(&self, key: &str) -> BackendResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT id, key, filename, content_type, size_bytes, etag, content_digest,
                    owner, uploader_ip, uploaded_at
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => BackendError::NotFound(format!("object `{}`", key)),
            other => other.into(),
        })
    }

    async fn check_sqlite(&self) -> CheckStatus {
        let (ok, error) = match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => (true, None),
            Ok(v) => (false, Some(format!("unexpected result: {}", v))),
            Err(e) => (false, Some(format!("error: {}", e))),
        };
        CheckStatus {
            name: "sqlite",
            ok,
            error,
        }
    }

    async fn check_disk(&self) -> CheckStatus {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        let (ok, error) = match fs::write(&tmp_path, b"readyz").await {
            Ok(_) => match fs::read(&tmp_path).await {
                Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                    Ok(_) => (true, None),
                    Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
                },
                Ok(_) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    (false, Some("file content mismatch".to_string()))
                }
                Err(e) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    (false, Some(format!("could not read tmp file: {}", e)))
                }
            },
            Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
        };
        CheckStatus {
            name: "disk",
            ok,
            error,
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    async fn create_multipart(&self, key: &str, content_type: &str) -> BackendResult<String> {
        self.ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(self.staging_dir(&upload_id)?).await?;
        debug!(%upload_id, key, content_type, "staging directory created");
        Ok(upload_id)
    }

    async fn put_part(&self, upload_id: &str, index: u32, bytes: Bytes) -> BackendResult<String> {
        let staging = self.ensure_staging_exists(upload_id).await?;
        Self::write_atomically(&Self::part_path(&staging, index), &bytes).await?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[(u32, String)],
        metadata: &ObjectMetadata,
    ) -> BackendResult<StoredObject> {
        self.ensure_key_safe(key)?;
        let staging = self.ensure_staging_exists(upload_id).await?;

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BackendError::Fatal("object path missing parent directory".into()))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let (size_bytes, etag) = match Self::assemble(&staging, parts, &mut file).await {
            Ok((size, _)) if size != metadata.size_bytes => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Fatal(format!(
                    "assembled {} bytes, expected {}",
                    size, metadata.size_bytes
                )));
            }
            Ok(assembled) => assembled,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }

        let insert_result = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (
                id, key, filename, content_type, size_bytes, etag,
                content_digest, owner, uploader_ip, uploaded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                content_digest = excluded.content_digest,
                owner = excluded.owner,
                uploader_ip = excluded.uploader_ip,
                uploaded_at = excluded.uploaded_at
            RETURNING id, key, filename, content_type, size_bytes, etag,
                      content_digest, owner, uploader_ip, uploaded_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(metadata.filename.clone())
        .bind(&metadata.content_type)
        .bind(size_bytes as i64)
        .bind(&etag)
        .bind(&metadata.content_digest)
        .bind(&metadata.owner)
        .bind(metadata.uploader_ip.clone())
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        let object = match insert_result {
            Ok(obj) => obj,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(err.into());
            }
        };

        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!(
                "failed to remove staging directory {}: {}",
                staging.display(),
                err
            );
        }

        Ok(object)
    }

    async fn abort_multipart(&self, upload_id: &str) -> BackendResult<()> {
        let staging = self.staging_dir(upload_id)?;
        match fs::remove_dir_all(&staging).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(format!("upload `{}`", upload_id)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn sign_url(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        self.ensure_key_safe(key)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.signed_url(key, expires)
    }

    async fn verify_signature(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> BackendResult<()> {
        if Utc::now().timestamp() >= expires {
            return Err(BackendError::Denied("link expired".into()));
        }
        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BackendError::Denied("malformed signature".into()))?;
        let mut mac = self.mac()?;
        mac.update(format!("GET\n{}\n{}", key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| BackendError::Denied("signature mismatch".into()))
    }

    async fn open_object(&self, key: &str) -> BackendResult<(StoredObject, ObjectReader)> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::NotFound(format!("object `{}`", key))
            } else {
                err.into()
            }
        })?;
        Ok((object, Box::pin(file)))
    }

    async fn health(&self) -> Vec<CheckStatus> {
        vec![self.check_sqlite().await, self.check_disk().await]
    }
}
