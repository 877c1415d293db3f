// dbship/src/backup/s3_upload.rs
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::retry::RetryConfig;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;

use crate::backup::archive::{move_into_place, remove_path};
use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};
use crate::utils::setting::DatabaseAccess;

const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: u64 = 64 * 1024 * 1024;
const BYTES_PER_GB: f64 = (1024u64 * 1024 * 1024) as f64;

/// Accounting row for one confirmed upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRecord {
    /// Full object key, prefix included.
    pub key: String,
    /// Object name without the channel prefix, as stored in the accounting table.
    pub name: String,
    pub size_bytes: i64,
    pub size_gb: f64,
    pub created_at: DateTime<Utc>,
    pub written_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()>;

    /// Content length reported by a metadata-only request on `key`.
    async fn head_content_length(&self, key: &str) -> anyhow::Result<Option<i64>>;
}

/// `<db>_<YYYY-MM-DD_HH-MM-SS>.<ext>`, UTC, second precision.
pub fn object_name(db_name: &str, at: DateTime<Utc>, extension: &str) -> String {
    format!("{}_{}.{}", db_name, at.format("%Y-%m-%d_%H-%M-%S"), extension)
}

pub fn bytes_to_gb(bytes: i64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .credentials_provider(Credentials::new(
                &storage.key,
                &storage.secret,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .retry_config(RetryConfig::standard().with_max_attempts(storage.max_attempts));
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        S3ObjectStore {
            client: s3::Client::new(&sdk_config),
            bucket: storage.bucket.clone(),
        }
    }

    async fn put_single(&self, path: &Path, key: &str) -> anyhow::Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {} to bucket {}", key, self.bucket))?;
        Ok(())
    }

    async fn put_multipart(&self, path: &Path, key: &str, size: u64) -> anyhow::Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload of {}", key))?;
        let upload_id = created
            .upload_id()
            .context("S3 returned no multipart upload id")?
            .to_string();

        let parts = match self.upload_parts(path, key, &upload_id, size).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!("Failed to abort multipart upload of {}: {}", key, abort_err);
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to complete multipart upload of {}", key))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> anyhow::Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let len = PART_SIZE.min(size - offset);
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(len))
                .build()
                .await
                .with_context(|| format!("Failed to read part {} of {}", part_number, path.display()))?;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .with_context(|| format!("Failed to upload part {} of {}", part_number, key))?;
            tracing::debug!("Uploaded part {} of {} ({} bytes)", part_number, key, len);

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += len;
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(&self, path: &Path, key: &str) -> anyhow::Result<()> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if size > MULTIPART_THRESHOLD {
            self.put_multipart(path, key, size).await
        } else {
            self.put_single(path, key).await
        }
    }

    async fn head_content_length(&self, key: &str) -> anyhow::Result<Option<i64>> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("HEAD {} in bucket {} failed", key, self.bucket))?;
        Ok(head.content_length())
    }
}

/// Ships finished archives to object storage and books them in the accounting table.
pub struct RemoteShipper {
    store: Box<dyn ObjectStore>,
    key_prefix: String,
}

impl RemoteShipper {
    pub fn new(store: Box<dyn ObjectStore>, key_prefix: impl Into<String>) -> Self {
        RemoteShipper {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn object_key(&self, db_name: &str, at: DateTime<Utc>, extension: &str) -> String {
        format!("{}{}", self.key_prefix, object_name(db_name, at, extension))
    }

    /// Uploads `archive`, confirms it with a HEAD request, records it, then deletes it.
    ///
    /// When the upload cannot be confirmed the archive is moved to `keep_at` instead of
    /// being deleted and `UploadUnconfirmed` is returned. No accounting row is written.
    pub async fn ship(
        &self,
        database: &dyn DatabaseAccess,
        db_name: &str,
        archive: &Path,
        extension: &str,
        now: DateTime<Utc>,
        keep_at: &Path,
    ) -> Result<UploadRecord> {
        let name = object_name(db_name, now, extension);
        let key = self.object_key(db_name, now, extension);
        tracing::info!(
            "Uploading {} to bucket {} with key {}",
            archive.display(),
            self.store.bucket(),
            key
        );

        let confirmed = match self.store.put_file(archive, &key).await {
            Ok(()) => self.confirm(&key).await,
            Err(e) => Err(e.context("upload failed after retries")),
        };
        let size_bytes = match confirmed {
            Ok(size) => size,
            Err(e) => return Err(self.preserve(archive, &key, keep_at, e)),
        };

        let record = UploadRecord {
            key: key.clone(),
            name,
            size_bytes,
            size_gb: bytes_to_gb(size_bytes),
            created_at: now,
            written_at: Utc::now(),
        };

        let mut session = database.open_session(db_name).await?;
        let inserted = session.insert_upload_record(&record).await;
        let closed = session.close().await;
        inserted?;
        if let Err(e) = closed {
            tracing::warn!("{:#}", e);
        }
        tracing::info!(
            "✓ Recorded {} ({:.3} GB) in accounting table",
            record.name,
            record.size_gb
        );

        remove_path(archive)
            .with_context(|| format!("Failed to remove uploaded archive {}", archive.display()))?;
        tracing::info!("✅ Uploaded and confirmed {}", key);
        Ok(record)
    }

    async fn confirm(&self, key: &str) -> anyhow::Result<i64> {
        match self.store.head_content_length(key).await? {
            Some(len) if len >= 0 => Ok(len),
            Some(len) => Err(anyhow!("HEAD returned negative content length {}", len)),
            None => Err(anyhow!("HEAD returned no content length")),
        }
    }

    fn preserve(&self, archive: &Path, key: &str, keep_at: &Path, reason: anyhow::Error) -> BackupError {
        tracing::error!("Upload of {} unconfirmed: {:#}", key, reason);
        let kept = match move_into_place(archive, keep_at) {
            Ok(()) => keep_at.to_path_buf(),
            Err(e) => {
                tracing::warn!("Could not move archive to {}: {}", keep_at.display(), e);
                archive.to_path_buf()
            }
        };
        BackupError::UploadUnconfirmed {
            key: key.to_string(),
            kept,
            reason: format!("{:#}", reason),
        }
    }
}
