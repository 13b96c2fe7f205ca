//! Durable records of stored images and in-flight object uploads

mod sqlite;

pub use sqlite::SqliteMetadataStore;

use crate::types::{FileRecord, NewFileRecord, UploadIntent, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the metadata store
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Upload intent {0} no longer exists")]
    IntentMissing(i64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Metadata task failed: {0}")]
    Join(String),
}

/// Store for file records and upload intents.
///
/// An intent is written before an object is uploaded and removed in the
/// same transaction that inserts the object's file record, so every stored
/// object is covered by one or the other.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Record that `object_key` is about to be uploaded. Returns the intent id.
    async fn record_intent(
        &self,
        user: UserId,
        file_name: &str,
        object_key: &str,
    ) -> Result<i64, MetadataError>;

    /// Insert the file record and delete its intent atomically.
    async fn commit_file(
        &self,
        intent_id: i64,
        record: NewFileRecord,
    ) -> Result<FileRecord, MetadataError>;

    /// Delete an intent whose object is known not to exist.
    async fn discard_intent(&self, intent_id: i64) -> Result<(), MetadataError>;

    /// Intents created before `before`, oldest first.
    async fn stale_intents(&self, before: DateTime<Utc>)
        -> Result<Vec<UploadIntent>, MetadataError>;

    async fn user_intents(&self, user: UserId) -> Result<Vec<UploadIntent>, MetadataError>;

    /// File records of `user`, newest first.
    async fn list_files(&self, user: UserId) -> Result<Vec<FileRecord>, MetadataError>;

    async fn count_files(&self) -> Result<u64, MetadataError>;
}
