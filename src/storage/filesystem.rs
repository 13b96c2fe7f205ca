//! Filesystem object store: one file per key under a root directory

use super::traits::{encode_path, join_url, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument};

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

/// Convert an io::Error into StorageError, detecting disk-full (ENOSPC).
fn io_to_storage_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::DiskFull
    } else {
        StorageError::Io(e)
    }
}

/// Atomically write data to a file using write-to-temp + fsync + rename.
async fn atomic_write(path: &Path, data: Bytes) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Other("Cannot atomic-write to a path with no parent".into()))?
        .to_path_buf();
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_storage_error)?;
        tmp.write_all(&data).map_err(io_to_storage_error)?;
        tmp.as_file().sync_all().map_err(io_to_storage_error)?;
        tmp.persist(&path)
            .map_err(|e| io_to_storage_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
}

/// Filesystem object store
///
/// Storage layout:
/// ```text
/// {root}/{prefix}/user_{id}/{stem}_{suffix}{ext}
/// ```
///
/// Object references are `{public_base_url}/{key}` when a base URL is
/// configured, otherwise `file://` URLs.
pub struct FilesystemBackend {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`, creating the directory.
    pub async fn new(root: PathBuf, public_base_url: Option<String>) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        let root = fs::canonicalize(&root).await?;
        Ok(Self {
            root,
            public_base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file, refusing keys that escape the root.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Collect keys of every file below `dir` into `keys`.
    fn walk<'a>(
        &'a self,
        dir: PathBuf,
        keys: &'a mut Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let ft = entry.file_type().await?;
                if ft.is_dir() {
                    self.walk(path, keys).await?;
                } else if ft.is_file() {
                    // Skip in-progress atomic writes
                    let hidden = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(".tmp"));
                    if hidden {
                        continue;
                    }
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let key: Vec<String> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        keys.push(key.join("/"));
                    }
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self))]
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await?;
        debug!("Using object directory {:?}", self.root);
        Ok(())
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn put_object(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let len = data.len();
        atomic_write(&path, data).await?;
        debug!("Wrote {} ({} bytes, {})", key, len, content_type);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat_object(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(StorageError::NotFound(key.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Walk from the deepest directory named by the prefix, then filter.
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_part)?
        };

        let mut keys = Vec::new();
        self.walk(start, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => join_url(base, key),
            None => format!(
                "file://{}",
                encode_path(&self.root.join(key).to_string_lossy())
            ),
        }
    }

    async fn presigned_url(&self, key: &str, _ttl: Duration) -> Result<String, StorageError> {
        self.stat_object(key).await?;
        Ok(self.object_url(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend(dir: &TempDir) -> FilesystemBackend {
        FilesystemBackend::new(dir.path().join("objects"), Some("http://files.local".into()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_stat_delete() {
        let dir = TempDir::new().unwrap();
        let store = backend(&dir).await;
        let key = "upload/user_7/receipt_abcd1234.png";

        store
            .put_object(key, Bytes::from_static(b"image"), "image/png")
            .await
            .unwrap();
        assert_eq!(store.get_object(key).await.unwrap(), b"image");
        assert_eq!(store.stat_object(key).await.unwrap(), 5);

        store.delete_object(key).await.unwrap();
        assert!(matches!(
            store.stat_object(key).await,
            Err(StorageError::NotFound(_))
        ));
        // Deleting again is fine
        store.delete_object(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix_is_scoped_per_user() {
        let dir = TempDir::new().unwrap();
        let store = backend(&dir).await;
        for key in [
            "upload/user_1/a_00000000.png",
            "upload/user_1/b_00000000.png",
            "upload/user_12/c_00000000.png",
        ] {
            store
                .put_object(key, Bytes::from_static(b"x"), "image/png")
                .await
                .unwrap();
        }

        let keys = store.list_prefix("upload/user_1/").await.unwrap();
        assert_eq!(
            keys,
            vec!["upload/user_1/a_00000000.png", "upload/user_1/b_00000000.png"]
        );
        assert!(store.list_prefix("upload/user_99/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let store = backend(&dir).await;
        let result = store
            .put_object("../outside.png", Bytes::from_static(b"x"), "image/png")
            .await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
        assert!(matches!(
            store.get_object("/etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_object_url_and_presign() {
        let dir = TempDir::new().unwrap();
        let store = backend(&dir).await;
        let key = "upload/user_7/receipt_abcd1234.png";
        assert_eq!(
            store.object_url(key),
            "http://files.local/upload/user_7/receipt_abcd1234.png"
        );

        assert!(store
            .presigned_url(key, Duration::from_secs(60))
            .await
            .is_err());
        store
            .put_object(key, Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap();
        assert_eq!(
            store.presigned_url(key, Duration::from_secs(60)).await.unwrap(),
            store.object_url(key)
        );
    }

    #[tokio::test]
    async fn test_file_url_escapes_key() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBackend::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        let url = store.object_url("upload/user_7/receipt #2_abcd1234.png");
        assert!(url.starts_with("file:///"), "{}", url);
        assert!(url.ends_with("/upload/user_7/receipt%20%232_abcd1234.png"), "{}", url);
        assert!(!url.contains('#'));
    }
}
