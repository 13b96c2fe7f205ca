//! File listing and maintenance handlers

use super::AppState;
use crate::api::extractors::UserIdentity;
use crate::pipeline::MaintenanceError;
use crate::types::FileListing;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct FilesResponse {
    pub files: Vec<FileListing>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub removed: Vec<String>,
}

/// GET /v1/files - the caller's stored files, newest first
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    UserIdentity(user): UserIdentity,
) -> Result<Json<FilesResponse>, MaintenanceError> {
    let files = state.pipeline.list_files(user).await?;
    Ok(Json(FilesResponse { files }))
}

/// POST /v1/files/reconcile - delete the caller's objects that have no record
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    UserIdentity(user): UserIdentity,
) -> Result<Json<ReconcileResponse>, MaintenanceError> {
    let removed = state.pipeline.sweep_user_orphans(user).await?;
    Ok(Json(ReconcileResponse { removed }))
}
