//! Health check handler

use super::AppState;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store_ready: bool,
    pub active_sessions: usize,
    /// Committed file records; absent when the database could not be read.
    pub stored_files: Option<u64>,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_ready = state.pipeline.store_ready();
    Json(HealthResponse {
        status: if store_ready { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store_ready,
        active_sessions: state.pipeline.registry().active_sessions(),
        stored_files: state.pipeline.stored_files().await,
    })
}
