//! Object byte storage behind the blob store.
//!
//! Backends only move bytes. Name validation, metadata, quotas and public
//! URLs belong to [`crate::murmur::blobs::BlobStore`].

mod filesystem;

use async_trait::async_trait;

pub use filesystem::FilesystemBackend;

/// Where attachment bytes live.
///
/// `bucket` and `name` have already been validated as single path segments
/// when a backend sees them.
#[async_trait]
pub trait ObjectBackend: Send + Sync + std::fmt::Debug {
    /// Stores `data`, replacing any existing object. Readers observe either
    /// the old bytes or the new ones, never a partial write.
    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> std::io::Result<()>;

    /// Returns `None` if the object does not exist.
    async fn get(&self, bucket: &str, name: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Returns whether an object was removed.
    async fn remove(&self, bucket: &str, name: &str) -> std::io::Result<bool>;
}
