//! Attachment objects addressed by bucket and name, published under stable
//! public URLs.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::murmur::database::{Database, DatabaseError};
use crate::murmur::error::ErrorKind;
use crate::murmur::media_policy::MediaPolicy;
use crate::murmur::storage::ObjectBackend;

pub use crate::murmur::database::blobs::BlobObject;

const PUBLIC_PATH: &str = "storage/v1/object/public";
const MAX_NAME_LEN: usize = 128;
const DEFAULT_MAX_OBJECT_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("Invalid blob request: {0}")]
    Validation(String),

    #[error("Blob storage unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Quota exceeded for bucket {bucket}: {requested} bytes requested, limit is {limit}")]
    QuotaExceeded {
        bucket: String,
        requested: u64,
        limit: u64,
    },

    #[error("Object not found: {bucket}/{name}")]
    NotFound { bucket: String, name: String },

    #[error("Blob metadata error: {0}")]
    Database(#[source] DatabaseError),
}

impl BlobStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlobStoreError::Validation(_) => ErrorKind::Validation,
            BlobStoreError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            BlobStoreError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            BlobStoreError::NotFound { .. } => ErrorKind::NotFound,
            BlobStoreError::Database(_) => ErrorKind::Internal,
        }
    }
}

impl From<DatabaseError> for BlobStoreError {
    fn from(err: DatabaseError) -> Self {
        if err.is_unavailable() {
            BlobStoreError::StoreUnavailable(err.to_string())
        } else {
            BlobStoreError::Database(err)
        }
    }
}

impl From<std::io::Error> for BlobStoreError {
    fn from(err: std::io::Error) -> Self {
        BlobStoreError::StoreUnavailable(err.to_string())
    }
}

type Result<T> = std::result::Result<T, BlobStoreError>;

/// Size limits enforced on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStoreConfig {
    pub max_object_bytes: u64,
    /// Total bytes a single bucket may hold. `None` means unlimited.
    pub max_bucket_bytes: Option<u64>,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
            max_bucket_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Replace an existing object with the same name instead of failing.
    pub upsert: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self { upsert: true }
    }
}

/// Stores attachment bytes through an [`ObjectBackend`] and keeps their
/// metadata in the `blobs` table.
///
/// Uploads to one bucket are serialized so the quota check and the write
/// cannot interleave with another upload to the same bucket.
#[derive(Clone)]
pub struct BlobStore {
    database: Arc<Database>,
    backend: Arc<dyn ObjectBackend>,
    config: BlobStoreConfig,
    public_base_url: String,
    bucket_guards: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl BlobStore {
    pub fn new(
        database: Arc<Database>,
        backend: Arc<dyn ObjectBackend>,
        public_base_url: &str,
        config: BlobStoreConfig,
    ) -> Self {
        Self {
            database,
            backend,
            config,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            bucket_guards: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> BlobStoreConfig {
        self.config
    }

    /// Stores `data` as `bucket/name` and returns its public URL.
    ///
    /// # Errors
    ///
    /// - [`BlobStoreError::Validation`] for bad names, or if the object exists
    ///   and `options.upsert` is false.
    /// - [`BlobStoreError::QuotaExceeded`] if the object or the bucket would
    ///   exceed the configured limits.
    /// - [`BlobStoreError::StoreUnavailable`] if bytes or metadata cannot be written.
    pub async fn upload(
        &self,
        bucket: &str,
        name: &str,
        data: &[u8],
        options: UploadOptions,
    ) -> Result<String> {
        validate_segment("bucket", bucket)?;
        validate_segment("object name", name)?;

        let size = data.len() as u64;
        if size > self.config.max_object_bytes {
            return Err(BlobStoreError::QuotaExceeded {
                bucket: bucket.to_string(),
                requested: size,
                limit: self.config.max_object_bytes,
            });
        }

        let guard = self.bucket_guard(bucket);
        let _lock = guard.lock().await;

        let existing = BlobObject::find(&self.database, bucket, name).await?;
        if existing.is_some() && !options.upsert {
            return Err(BlobStoreError::Validation(format!(
                "{bucket}/{name} already exists"
            )));
        }

        if let Some(limit) = self.config.max_bucket_bytes {
            let used = BlobObject::bucket_usage(&self.database, bucket).await?;
            let replaced = existing.as_ref().map(|object| object.size_bytes).unwrap_or(0);
            let requested = used.saturating_sub(replaced).saturating_add(size);
            if requested > limit {
                return Err(BlobStoreError::QuotaExceeded {
                    bucket: bucket.to_string(),
                    requested,
                    limit,
                });
            }
        }

        // Restored if the metadata write fails after the bytes land
        let previous = match existing {
            Some(_) => self.backend.get(bucket, name).await?,
            None => None,
        };

        self.backend.put(bucket, name, data).await.map_err(|e| {
            tracing::error!(
                target: "murmur::blobs::upload",
                "Failed to write {}/{}: {}",
                bucket,
                name,
                e
            );
            BlobStoreError::from(e)
        })?;

        let sha256 = hex::encode(Sha256::digest(data));
        if let Err(e) = BlobObject::upsert(
            &self.database,
            bucket,
            name,
            &sha256,
            size,
            MediaPolicy::sniff(data),
        )
        .await
        {
            tracing::error!(
                target: "murmur::blobs::upload",
                "Failed to record metadata for {}/{}, rolling back bytes: {}",
                bucket,
                name,
                e
            );
            self.roll_back(bucket, name, previous.as_deref()).await;
            return Err(e.into());
        }

        tracing::info!(
            target: "murmur::blobs::upload",
            "Uploaded {}/{} ({} bytes)",
            bucket,
            name,
            size
        );

        Ok(self.url_for(bucket, name))
    }

    /// Puts back the bytes an object held before a failed upload, or removes
    /// the object if it did not exist.
    async fn roll_back(&self, bucket: &str, name: &str, previous: Option<&[u8]>) {
        let result = match previous {
            Some(bytes) => self.backend.put(bucket, name, bytes).await,
            None => self.backend.remove(bucket, name).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!(
                target: "murmur::blobs::roll_back",
                "Failed to roll back {}/{}: {}",
                bucket,
                name,
                e
            );
        }
    }

    /// The public URL of an existing object.
    pub async fn public_url_for(&self, bucket: &str, name: &str) -> Result<String> {
        validate_segment("bucket", bucket)?;
        validate_segment("object name", name)?;

        match BlobObject::find(&self.database, bucket, name).await? {
            Some(_) => Ok(self.url_for(bucket, name)),
            None => Err(not_found(bucket, name)),
        }
    }

    pub async fn download(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        validate_segment("bucket", bucket)?;
        validate_segment("object name", name)?;

        self.backend
            .get(bucket, name)
            .await?
            .ok_or_else(|| not_found(bucket, name))
    }

    /// Reads back the object behind a URL previously returned by this store.
    pub async fn resolve(&self, url: &str) -> Result<Vec<u8>> {
        let (bucket, name) = self.parse_url(url)?;
        self.download(bucket, name).await
    }

    pub async fn stat(&self, bucket: &str, name: &str) -> Result<Option<BlobObject>> {
        validate_segment("bucket", bucket)?;
        validate_segment("object name", name)?;

        Ok(BlobObject::find(&self.database, bucket, name).await?)
    }

    fn url_for(&self, bucket: &str, name: &str) -> String {
        format!("{}/{PUBLIC_PATH}/{bucket}/{name}", self.public_base_url)
    }

    fn parse_url<'u>(&self, url: &'u str) -> Result<(&'u str, &'u str)> {
        let foreign = || BlobStoreError::Validation(format!("{url} was not issued by this store"));

        let path = url
            .strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_prefix(PUBLIC_PATH))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(foreign)?;
        let (bucket, name) = path.split_once('/').ok_or_else(foreign)?;

        validate_segment("bucket", bucket)?;
        validate_segment("object name", name)?;
        Ok((bucket, name))
    }

    fn bucket_guard(&self, bucket: &str) -> Arc<Mutex<()>> {
        self.bucket_guards
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("backend", &self.backend)
            .field("config", &self.config)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

fn not_found(bucket: &str, name: &str) -> BlobStoreError {
    BlobStoreError::NotFound {
        bucket: bucket.to_string(),
        name: name.to_string(),
    }
}

/// Bucket and object names are single path segments: 1 to 128 characters of
/// `[A-Za-z0-9._-]`, not starting with a dot.
fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_NAME_LEN {
        return Err(BlobStoreError::Validation(format!(
            "{what} must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    if value.starts_with('.') {
        return Err(BlobStoreError::Validation(format!(
            "{what} {value:?} must not start with a dot"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(BlobStoreError::Validation(format!(
            "{what} {value:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}
