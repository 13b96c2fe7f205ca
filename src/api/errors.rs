//! HTTP mapping of pipeline errors

use crate::error::IngestError;
use crate::pipeline::MaintenanceError;
use crate::types::{ErrorKind, UploadAck};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// HTTP status for an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest | ErrorKind::InvalidChunk => StatusCode::BAD_REQUEST,
        ErrorKind::NoActiveSession => StatusCode::NOT_FOUND,
        ErrorKind::ChunkInFlight => StatusCode::CONFLICT,
        ErrorKind::ChunkWrite
        | ErrorKind::Transform
        | ErrorKind::StorageUpload
        | ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Failed `UploadAck` for `err`, echoing the chunk status of the request.
pub fn ack_response(err: &IngestError, chunk_status: String) -> Response {
    let ack = UploadAck::failed(chunk_status, err.to_string(), err.ack_error());
    (status_for(err.kind()), Json(ack)).into_response()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        ack_response(&self, String::new())
    }
}

#[derive(Debug, Serialize)]
struct MaintenanceBody {
    success: bool,
    message: String,
    kind: ErrorKind,
}

impl IntoResponse for MaintenanceError {
    fn into_response(self) -> Response {
        let kind = match &self {
            MaintenanceError::NotInitialized => ErrorKind::NotInitialized,
            MaintenanceError::Storage(_) => ErrorKind::StorageUpload,
            MaintenanceError::Metadata(_) => ErrorKind::Persistence,
        };
        let body = MaintenanceBody {
            success: false,
            message: self.to_string(),
            kind,
        };
        (status_for(kind), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Stage, UserId};

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::InvalidChunk), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NoActiveSession), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::ChunkInFlight), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::NotInitialized),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorKind::Persistence),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_timeout_response_status() {
        let err = IngestError::Timeout {
            stage: Stage::Transform,
            user: UserId(7),
            filename: "receipt.png".into(),
        };
        let response = ack_response(&err, "3/3".into());
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
