//! Receipt Ingest - resumable chunked uploads of receipt images
//!
//! Chunks are assembled on local disk per user and filename. The chunk that
//! completes an upload converts the image to grayscale, stores it in an
//! object store and records it in SQLite.

pub mod api;
pub mod chunk_writer;
pub mod config;
pub mod error;
pub mod janitor;
pub mod metadata;
pub mod pipeline;
pub mod reclaim;
pub mod registry;
pub mod storage;
pub mod transform;
pub mod types;
