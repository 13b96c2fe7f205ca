//! Positional chunk writes into a session's temp file

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{instrument, trace};

/// Write one chunk at `offset` in `path`.
///
/// Creates the containing directory and the file on first use. The file is
/// never truncated, so chunks may land in any order and a re-sent chunk
/// overwrites its own range with the same bytes.
#[instrument(skip(data), fields(len = data.len()))]
pub async fn write_chunk(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    // tokio completes writes in the background; flush before reporting success.
    file.flush().await?;

    trace!("Wrote {} bytes at offset {} to {:?}", data.len(), offset, path);
    Ok(())
}

/// Check a chunk's length against the session's declared layout.
///
/// Every chunk but the last must fill `chunk_size` exactly; the last may be
/// shorter, including empty.
pub fn check_chunk_len(index: u32, total: u32, chunk_size: u64, len: u64) -> Result<(), String> {
    if len > chunk_size {
        return Err(format!(
            "chunk {} is {} bytes, larger than declared chunk size {}",
            index, len, chunk_size
        ));
    }
    if index < total && len != chunk_size {
        return Err(format!(
            "chunk {} of {} is {} bytes; only the last chunk may be shorter than {}",
            index, total, len, chunk_size
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_creates_directory_on_first_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("user_7").join("temp_receipt.png");

        write_chunk(&path, 0, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_land_at_their_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");

        write_chunk(&path, 8, b"ccc").await.unwrap();
        write_chunk(&path, 0, b"aaaa").await.unwrap();
        write_chunk(&path, 4, b"bbbb").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"aaaabbbbccc");
    }

    #[tokio::test]
    async fn test_rewrite_same_chunk_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");

        write_chunk(&path, 0, b"aaaa").await.unwrap();
        write_chunk(&path, 4, b"bb").await.unwrap();
        write_chunk(&path, 0, b"aaaa").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"aaaabb");
    }

    #[tokio::test]
    async fn test_empty_chunk_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");

        write_chunk(&path, 0, b"").await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_parent_is_a_file_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("user_7");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = write_chunk(&blocker.join("temp.png"), 0, b"x").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_check_chunk_len() {
        assert!(check_chunk_len(1, 3, 4, 4).is_ok());
        assert!(check_chunk_len(3, 3, 4, 1).is_ok());
        assert!(check_chunk_len(3, 3, 4, 0).is_ok());
        assert!(check_chunk_len(1, 3, 4, 3).is_err());
        assert!(check_chunk_len(3, 3, 4, 5).is_err());
    }
}
