//! Object store trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Insufficient storage space")]
    DiskFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Backing store for processed images.
///
/// Keys are `/`-separated and never start with `/`. Objects are written once
/// under a fresh key and never overwritten by this service.
///
/// This trait is object-safe and is used as `Box<dyn ObjectStore>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    /// Store `data` under `key`.
    async fn put_object(&self, key: &str, data: Bytes, content_type: &str)
        -> Result<(), StorageError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Size of the object at `key`, or `NotFound`.
    async fn stat_object(&self, key: &str) -> Result<u64, StorageError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Stable reference returned to clients after a successful upload.
    fn object_url(&self, key: &str) -> String;

    /// Time-limited download URL for an existing object.
    ///
    /// Backends without request signing return `object_url`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Join a public base URL and a key with exactly one `/`.
pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        encode_path(key.trim_start_matches('/'))
    )
}

/// Percent-encode each `/`-separated segment of a key or path.
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://localhost:9000/receipts/", "upload/user_7/a_12345678.png"),
            "http://localhost:9000/receipts/upload/user_7/a_12345678.png"
        );
        assert_eq!(join_url("http://cdn", "/k"), "http://cdn/k");
    }

    #[test]
    fn test_join_url_escapes_reserved_characters() {
        assert_eq!(
            join_url("http://cdn/receipts", "upload/user_7/receipt #2?%_abcd1234.png"),
            "http://cdn/receipts/upload/user_7/receipt%20%232%3F%25_abcd1234.png"
        );
    }
}
