//! Core types for the receipt ingestion pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest logical filename accepted from a client.
pub const MAX_FILENAME_LEN: usize = 255;

/// Errors that can occur when validating user-provided filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameValidationError(String);

impl fmt::Display for FilenameValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FilenameValidationError {}

/// Identifier of the owning user, as vouched for by the gateway's auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(UserId)
    }
}

/// Identity of one in-flight upload: the owning user plus the logical filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey {
    pub user: UserId,
    pub filename: String,
}

impl UploadKey {
    /// Build a key, validating the filename.
    pub fn new(user: UserId, filename: &str) -> Result<Self, FilenameValidationError> {
        validate_filename(filename)?;
        Ok(Self {
            user,
            filename: filename.to_string(),
        })
    }
}

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user_{}/{}", self.user, self.filename)
    }
}

/// Validate a logical filename.
///
/// The name becomes part of a local temp path and of the object key, so it
/// must be a single path component.
pub fn validate_filename(name: &str) -> Result<(), FilenameValidationError> {
    if name.is_empty() {
        return Err(FilenameValidationError(
            "Filename must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(FilenameValidationError(format!(
            "Filename exceeds {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(FilenameValidationError(
            "Filename must not contain NUL bytes".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(FilenameValidationError(
            "Filename must not contain path separators".to_string(),
        ));
    }
    if name == "." || name == ".." {
        return Err(FilenameValidationError("Invalid filename".to_string()));
    }
    Ok(())
}

/// One chunk as delivered by the client.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub user: UserId,
    pub filename: String,
    /// 1-based chunk index.
    pub index: u32,
    /// Declared total number of chunks.
    pub total: u32,
    /// Declared fixed chunk size; only the last chunk may be shorter.
    pub chunk_size: u64,
    pub data: bytes::Bytes,
}

impl ChunkRequest {
    /// `"<index>/<total>"`, echoed back to the caller.
    pub fn chunk_status(&self) -> String {
        format!("{}/{}", self.index, self.total)
    }
}

/// Result of a successfully accepted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAccepted {
    /// More chunks are outstanding.
    Pending { received: usize, total: u32 },
    /// The index had already been received; nothing was written.
    Duplicate,
    /// This chunk completed the upload and the pipeline stored it.
    Stored(StoredObject),
}

/// Durable location of a processed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub object_key: String,
    pub object_reference: String,
}

/// Stable, machine-readable error classification returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidChunk,
    NoActiveSession,
    ChunkInFlight,
    ChunkWrite,
    Transform,
    StorageUpload,
    Persistence,
    Timeout,
    NotInitialized,
}

/// Pipeline stage, attached to stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ChunkWrite,
    Transform,
    StorageUpload,
    Persistence,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::ChunkWrite => "chunk_write",
            Stage::Transform => "transform",
            Stage::StorageUpload => "storage_upload",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured error detail carried in a failed ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

/// Response to every chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub success: bool,
    pub message: String,
    /// Populated only on the chunk that completed the upload.
    pub object_reference: String,
    pub chunk_status: String,
    pub error: Option<AckError>,
}

impl UploadAck {
    /// Ack for an accepted chunk.
    pub fn accepted(request: &ChunkRequest, accepted: &ChunkAccepted) -> Self {
        let chunk_status = request.chunk_status();
        let (message, object_reference) = match accepted {
            ChunkAccepted::Pending { .. } => (
                format!("Chunk {} uploaded successfully", chunk_status),
                String::new(),
            ),
            ChunkAccepted::Duplicate => (
                format!("Chunk {} already received", chunk_status),
                String::new(),
            ),
            ChunkAccepted::Stored(stored) => (
                "File uploaded and processed successfully".to_string(),
                stored.object_reference.clone(),
            ),
        };
        Self {
            success: true,
            message,
            object_reference,
            chunk_status,
            error: None,
        }
    }

    /// Ack for a rejected chunk or a failed completion.
    pub fn failed(chunk_status: String, message: String, error: AckError) -> Self {
        Self {
            success: false,
            message,
            object_reference: String::new(),
            chunk_status,
            error: Some(error),
        }
    }
}

/// A persisted record of one stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub user_id: UserId,
    pub file_name: String,
    pub object_key: String,
    pub object_reference: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Fields of a FileRecord before the database assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub user_id: UserId,
    pub file_name: String,
    pub object_key: String,
    pub object_reference: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A file record as returned by the listing, with a download URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    #[serde(flatten)]
    pub record: FileRecord,
    /// Presigned URL, or the stored reference when signing is unavailable.
    pub url: String,
}

/// Write-ahead record of a remote put that has not been committed to metadata yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadIntent {
    pub id: i64,
    pub user_id: UserId,
    pub file_name: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("receipt.png").is_ok());
        assert!(validate_filename("Scan 2024-01-03 (1).jpeg").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("dir\\file.png").is_err());
        assert!(validate_filename("nul\0.png").is_err());
        assert!(validate_filename(&"a".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_upload_key_display() {
        let key = UploadKey::new(UserId(7), "receipt.png").unwrap();
        assert_eq!(key.to_string(), "user_7/receipt.png");
    }

    #[test]
    fn test_user_id_parse() {
        assert_eq!(" 42 ".parse::<UserId>().unwrap(), UserId(42));
        assert!("abc".parse::<UserId>().is_err());
        assert!("-1".parse::<UserId>().is_err());
    }

    #[test]
    fn test_ack_only_final_chunk_carries_reference() {
        let request = ChunkRequest {
            user: UserId(7),
            filename: "receipt.png".to_string(),
            index: 2,
            total: 3,
            chunk_size: 4,
            data: bytes::Bytes::from_static(b"abcd"),
        };
        let pending = UploadAck::accepted(
            &request,
            &ChunkAccepted::Pending {
                received: 2,
                total: 3,
            },
        );
        assert!(pending.success);
        assert_eq!(pending.object_reference, "");
        assert_eq!(pending.chunk_status, "2/3");

        let stored = UploadAck::accepted(
            &request,
            &ChunkAccepted::Stored(StoredObject {
                object_key: "upload/user_7/receipt_abcd1234.png".to_string(),
                object_reference: "http://localhost/test/upload/user_7/receipt_abcd1234.png"
                    .to_string(),
            }),
        );
        assert!(stored.success);
        assert!(!stored.object_reference.is_empty());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let err = AckError {
            kind: ErrorKind::NoActiveSession,
            stage: None,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"kind":"no_active_session"}"#);
    }
}
