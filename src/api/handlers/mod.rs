//! HTTP request handlers

mod files;
mod status;
mod upload;

pub use files::{list_files, reconcile, FilesResponse, ReconcileResponse};
pub use status::{health_check, HealthResponse};
pub use upload::{put_chunk, ChunkQuery};

use crate::pipeline::IngestPipeline;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}
