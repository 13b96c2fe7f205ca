//! HTTP API for chunked receipt uploads

mod errors;
mod extractors;
pub mod handlers;

pub use errors::{ack_response, status_for};
pub use extractors::{UserIdentity, USER_ID_HEADER};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use handlers::AppState;
use std::sync::Arc;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

/// Bytes allowed on top of the chunk size before axum rejects the body.
const BODY_SLACK: usize = 64 * 1024;

/// Build the router.
///
/// Bodies larger than `max_chunk_size` plus a small slack are rejected before
/// they reach the pipeline; at most `max_concurrent` requests are served at
/// once.
pub fn router(state: Arc<AppState>, max_chunk_size: u64, max_concurrent: usize) -> Router {
    let body_limit = usize::try_from(max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_SLACK);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/v1/files", get(handlers::list_files))
        .route("/v1/files/reconcile", post(handlers::reconcile))
        .route("/v1/files/:filename/chunks/:index", put(handlers::put_chunk))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent.max(1)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
