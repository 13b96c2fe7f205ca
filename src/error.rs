//! Pipeline error taxonomy

use crate::metadata::MetadataError;
use crate::storage::StorageError;
use crate::transform::TransformError;
use crate::types::{AckError, ErrorKind, Stage, UserId};
use thiserror::Error;

/// Errors surfaced to the caller of a chunk upload.
///
/// Stage failures carry the user and filename so the log line and the
/// returned message identify the upload without extra context.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("No active upload session for user {user} file {filename}")]
    NoActiveSession { user: UserId, filename: String },

    #[error("Chunk {index} of {filename} for user {user} is still being written, retry later")]
    ChunkInFlight {
        user: UserId,
        filename: String,
        index: u32,
    },

    #[error("Failed to write chunk {index} of {filename} for user {user}: {source}")]
    ChunkWrite {
        user: UserId,
        filename: String,
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not process image {filename} for user {user}: {source}")]
    Transform {
        user: UserId,
        filename: String,
        #[source]
        source: TransformError,
    },

    #[error("Failed to upload {filename} for user {user} to object storage: {source}")]
    StorageUpload {
        user: UserId,
        filename: String,
        #[source]
        source: StorageError,
    },

    #[error("Stored {object_key} but failed to record metadata for {filename} (user {user}): {source}")]
    Persistence {
        user: UserId,
        filename: String,
        object_key: String,
        #[source]
        source: MetadataError,
    },

    #[error("Stage {stage} timed out for {filename} (user {user})")]
    Timeout {
        stage: Stage,
        user: UserId,
        filename: String,
    },

    #[error("Object store client is not initialized")]
    NotInitialized,
}

impl IngestError {
    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            IngestError::InvalidChunk(_) => ErrorKind::InvalidChunk,
            IngestError::NoActiveSession { .. } => ErrorKind::NoActiveSession,
            IngestError::ChunkInFlight { .. } => ErrorKind::ChunkInFlight,
            IngestError::ChunkWrite { .. } => ErrorKind::ChunkWrite,
            IngestError::Transform { .. } => ErrorKind::Transform,
            IngestError::StorageUpload { .. } => ErrorKind::StorageUpload,
            IngestError::Persistence { .. } => ErrorKind::Persistence,
            IngestError::Timeout { .. } => ErrorKind::Timeout,
            IngestError::NotInitialized => ErrorKind::NotInitialized,
        }
    }

    /// The pipeline stage that failed, when the error came from one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            IngestError::ChunkWrite { .. } => Some(Stage::ChunkWrite),
            IngestError::Transform { .. } => Some(Stage::Transform),
            IngestError::StorageUpload { .. } => Some(Stage::StorageUpload),
            IngestError::Persistence { .. } => Some(Stage::Persistence),
            IngestError::Timeout { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn ack_error(&self) -> AckError {
        AckError {
            kind: self.kind(),
            stage: self.stage(),
        }
    }
}
