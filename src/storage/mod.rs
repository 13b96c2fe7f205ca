//! Object store abstraction

mod filesystem;
pub mod keys;
mod s3;
mod traits;

pub use filesystem::FilesystemBackend;
pub use s3::S3Backend;
pub use traits::{ObjectStore, StorageError};

use crate::config::BackendConfig;

/// Build the configured backend. Does not touch the network.
pub async fn build_backend(config: &BackendConfig) -> Result<Box<dyn ObjectStore>, StorageError> {
    match config {
        BackendConfig::Filesystem {
            path,
            public_base_url,
        } => Ok(Box::new(
            FilesystemBackend::new(path.clone(), public_base_url.clone()).await?,
        )),
        BackendConfig::S3 { .. } => Ok(Box::new(S3Backend::new(config)?)),
    }
}
