//! Deletion of a completion run's local temp files

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Owns the local artifacts of one completion run and deletes them once.
///
/// Call `finish` on every exit path; `Drop` covers early returns and panics
/// in between. Deletion failures are logged and never change the outcome of
/// the run.
#[derive(Debug, Default)]
pub struct Reclaimer {
    paths: Vec<PathBuf>,
    done: bool,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path that may or may not exist yet.
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Delete every tracked path. Returns how many files were removed.
    pub async fn finish(mut self) -> usize {
        self.done = true;
        let mut removed = 0;
        for path in std::mem::take(&mut self.paths) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!("Removed temp file {:?}", path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove temp file {:?}: {}", path, e),
            }
        }
        removed
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for path in &self.paths {
            remove_quietly(path);
        }
    }
}

/// Synchronous best-effort delete, for paths outside a completion run.
pub fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed temp file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove temp file {:?}: {}", path, e),
    }
}

/// Remove everything under the temp root left by a previous process.
///
/// Sessions live in memory only, so at startup every file under the root is
/// an orphan. Returns the number of files removed.
pub async fn sweep_temp_root(root: &Path) -> std::io::Result<usize> {
    if !tokio::fs::try_exists(root).await.unwrap_or(false) {
        tokio::fs::create_dir_all(root).await?;
        return Ok(0);
    }

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            let mut inner = tokio::fs::read_dir(&path).await?;
            while let Some(file) = inner.next_entry().await? {
                if file.file_type().await?.is_file() {
                    match tokio::fs::remove_file(file.path()).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!("Could not remove stale temp file {:?}: {}", file.path(), e),
                    }
                }
            }
            match tokio::fs::remove_dir(&path).await {
                Ok(()) => debug!("Removed stale temp directory {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove stale temp directory {:?}: {}", path, e),
            }
        } else {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove stale temp file {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}
