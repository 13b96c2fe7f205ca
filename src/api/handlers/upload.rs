//! Chunk upload handler

use super::AppState;
use crate::api::errors::ack_response;
use crate::api::extractors::UserIdentity;
use crate::error::IngestError;
use crate::types::{ChunkRequest, UploadAck, UserId};
use axum::extract::rejection::{BytesRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Query parameters of a chunk upload
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub total: u32,
    pub chunk_size: u64,
}

/// PUT /v1/files/:filename/chunks/:index?total=N&chunk_size=S
///
/// The body is the raw chunk. Every outcome is reported as an `UploadAck`;
/// only the chunk that completes the upload carries an object reference.
pub async fn put_chunk(
    State(state): State<Arc<AppState>>,
    UserIdentity(user): UserIdentity,
    Path((filename, index)): Path<(String, String)>,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let echoed = match &query {
        Ok(Query(q)) => format!("{}/{}", index, q.total),
        Err(_) => String::new(),
    };

    let request = match parse_request(user, filename, &index, query, body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected chunk upload: {}", e);
            return ack_response(&e, echoed);
        }
    };

    match state.pipeline.upload_chunk(request.clone()).await {
        Ok(accepted) => Json(UploadAck::accepted(&request, &accepted)).into_response(),
        Err(e) => ack_response(&e, request.chunk_status()),
    }
}

fn parse_request(
    user: UserId,
    filename: String,
    index: &str,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<ChunkRequest, IngestError> {
    let index = index
        .parse::<u32>()
        .ok()
        .filter(|i| *i >= 1)
        .ok_or_else(|| {
            IngestError::InvalidRequest(format!(
                "chunk index must be a positive integer, got {:?}",
                index
            ))
        })?;
    let Query(query) = query.map_err(|e| IngestError::InvalidRequest(e.body_text()))?;
    let data = body.map_err(|e| IngestError::InvalidChunk(e.body_text()))?;

    Ok(ChunkRequest {
        user,
        filename,
        index,
        total: query.total,
        chunk_size: query.chunk_size,
        data,
    })
}
