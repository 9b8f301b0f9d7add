use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::ObjectBackend;

/// Filesystem object storage organized by bucket
///
/// Directory structure:
/// ```text
/// <data_dir>/
///   blobs/
///     <bucket>/
///       <name>
/// ```
///
/// Writes are atomic: bytes go to a hidden temp file in the bucket directory
/// which is then renamed over the target. If the write future is dropped
/// part way, the temp file is removed.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Creates the backend rooted at `<data_dir>/blobs/`.
    pub fn new(data_dir: &Path) -> io::Result<Self> {
        let root = data_dir.join("blobs");

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.bucket_dir(bucket).join(name)
    }
}

/// Removes the temp file unless the write completed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                target: "murmur::storage::filesystem",
                "Failed to remove temp file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[async_trait]
impl ObjectBackend for FilesystemBackend {
    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> io::Result<()> {
        let bucket_dir = self.bucket_dir(bucket);
        if !bucket_dir.exists() {
            fs::create_dir_all(&bucket_dir).await?;
        }

        let file_path = bucket_dir.join(name);
        let temp_path = bucket_dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        let mut guard = TempFileGuard::new(temp_path.clone());

        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &file_path).await?;
        guard.disarm();

        tracing::debug!(
            target: "murmur::storage::filesystem",
            "Stored {} bytes at {}",
            data.len(),
            file_path.display()
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.object_path(bucket, name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, bucket: &str, name: &str) -> io::Result<bool> {
        match fs::remove_file(self.object_path(bucket, name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "tmp"))
            .collect()
    }

    #[tokio::test]
    async fn test_backend_creation() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path()).unwrap();

        assert!(backend.root().exists());
        assert_eq!(backend.root(), temp_dir.path().join("blobs"));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path()).unwrap();

        backend.put("images", "cat.png", b"png data").await.unwrap();

        assert!(backend.root().join("images").join("cat.png").exists());
        assert_eq!(
            backend.get("images", "cat.png").await.unwrap(),
            Some(b"png data".to_vec())
        );
        assert_eq!(backend.get("images", "dog.png").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_replaces_and_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path()).unwrap();

        backend.put("images", "cat.png", b"first").await.unwrap();
        backend.put("images", "cat.png", b"second").await.unwrap();

        assert_eq!(
            backend.get("images", "cat.png").await.unwrap(),
            Some(b"second".to_vec())
        );
        assert!(leftover_temp_files(&backend.root().join("images")).is_empty());
    }

    #[tokio::test]
    async fn test_buckets_are_separate() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path()).unwrap();

        backend.put("images", "a.bin", b"image").await.unwrap();
        backend.put("audios", "a.bin", b"audio").await.unwrap();

        assert_eq!(
            backend.get("images", "a.bin").await.unwrap(),
            Some(b"image".to_vec())
        );
        assert_eq!(
            backend.get("audios", "a.bin").await.unwrap(),
            Some(b"audio".to_vec())
        );
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path()).unwrap();

        backend.put("images", "cat.png", b"data").await.unwrap();

        assert!(backend.remove("images", "cat.png").await.unwrap());
        assert!(!backend.remove("images", "cat.png").await.unwrap());
        assert_eq!(backend.get("images", "cat.png").await.unwrap(), None);
    }

    #[test]
    fn test_temp_guard_removes_file_unless_disarmed() {
        let temp_dir = TempDir::new().unwrap();
        let kept = temp_dir.path().join("kept.tmp");
        let dropped = temp_dir.path().join("dropped.tmp");
        std::fs::write(&kept, b"x").unwrap();
        std::fs::write(&dropped, b"x").unwrap();

        let mut guard = TempFileGuard::new(kept.clone());
        guard.disarm();
        drop(guard);
        drop(TempFileGuard::new(dropped.clone()));

        assert!(kept.exists());
        assert!(!dropped.exists());
    }
}
