//! Shared test infrastructure for integration tests
//!
//! Provides an in-process pipeline harness, a TestServer that spawns the real
//! binary, image fixtures, and MinIO availability gating.

#![allow(dead_code)]

use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use receipt_ingest::metadata::{MetadataStore, SqliteMetadataStore};
use receipt_ingest::pipeline::{IngestPipeline, PipelineSettings};
use receipt_ingest::storage::{FilesystemBackend, ObjectStore};
use receipt_ingest::types::{ChunkRequest, UserId};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Port counter to avoid conflicts between tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

/// MinIO configuration constants
pub const MINIO_ENDPOINT: &str = "http://localhost:9000";
pub const MINIO_BUCKET: &str = "receipt-ingest-test";
pub const MINIO_ACCESS_KEY: &str = "minioadmin";
pub const MINIO_SECRET_KEY: &str = "minioadmin";

// === Fixtures ===

/// A PNG of seeded colour noise, so it barely compresses.
pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    encode_fixture(width, height, ImageFormat::Png)
}

pub fn encode_fixture(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(u64::from(width) << 32 | u64::from(height));
    let img = RgbImage::from_fn(width, height, |_, _| image::Rgb(rng.gen()));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("encode fixture");
    out.into_inner()
}

/// Split `data` into `chunk_size` pieces; the last may be shorter.
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

pub fn chunk_request(
    user: u64,
    filename: &str,
    index: u32,
    total: u32,
    chunk_size: u64,
    data: Bytes,
) -> ChunkRequest {
    ChunkRequest {
        user: UserId(user),
        filename: filename.to_string(),
        index,
        total,
        chunk_size,
        data,
    }
}

/// All files below `dir`, recursively.
pub fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_under(&path));
        } else {
            found.push(path);
        }
    }
    found
}

// === In-process pipeline harness ===

pub fn test_settings(temp_dir: &Path) -> PipelineSettings {
    PipelineSettings {
        temp_dir: temp_dir.to_path_buf(),
        key_prefix: "upload".to_string(),
        max_chunk_size: 1024 * 1024,
        max_upload_size: 16 * 1024 * 1024,
        stage_timeout: Duration::from_secs(10),
        session_ttl: Duration::from_secs(3600),
        completed_grace: Duration::from_secs(300),
        presign_ttl: Duration::from_secs(3600),
        reconcile_after: Duration::from_secs(600),
    }
}

/// A pipeline over a filesystem object store and an in-memory database.
pub struct Harness {
    pub pipeline: Arc<IngestPipeline>,
    pub metadata: SqliteMetadataStore,
    pub temp_dir: TempDir,
    pub store_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(|s| s, plain_store, sqlite_metadata).await
    }

    /// Harness with adjusted settings.
    pub async fn with_settings(adjust: impl FnOnce(PipelineSettings) -> PipelineSettings) -> Self {
        Self::build(adjust, plain_store, sqlite_metadata).await
    }

    /// Harness whose object store is `wrap(filesystem store)`.
    pub async fn with_store(
        wrap: impl FnOnce(FilesystemBackend) -> Box<dyn ObjectStore>,
    ) -> Self {
        Self::build(|s| s, wrap, sqlite_metadata).await
    }

    /// Harness whose metadata store is `wrap(sqlite store)`.
    pub async fn with_metadata(
        wrap: impl FnOnce(SqliteMetadataStore) -> Arc<dyn MetadataStore>,
    ) -> Self {
        Self::build(|s| s, plain_store, wrap).await
    }

    /// Harness with no object store installed.
    pub async fn uninitialized() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let store_dir = TempDir::new().expect("store dir");
        let metadata = SqliteMetadataStore::open_in_memory().expect("open db");
        let pipeline = Arc::new(IngestPipeline::new(
            test_settings(temp_dir.path()),
            Arc::new(metadata.clone()),
        ));
        Self {
            pipeline,
            metadata,
            temp_dir,
            store_dir,
        }
    }

    async fn build(
        adjust: impl FnOnce(PipelineSettings) -> PipelineSettings,
        wrap_store: impl FnOnce(FilesystemBackend) -> Box<dyn ObjectStore>,
        wrap_metadata: impl FnOnce(SqliteMetadataStore) -> Arc<dyn MetadataStore>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let store_dir = TempDir::new().expect("store dir");
        let metadata = SqliteMetadataStore::open_in_memory().expect("open db");

        let pipeline = Arc::new(IngestPipeline::new(
            adjust(test_settings(temp_dir.path())),
            wrap_metadata(metadata.clone()),
        ));
        let fs = FilesystemBackend::new(store_dir.path().to_path_buf(), None)
            .await
            .expect("filesystem store");
        let store = wrap_store(fs);
        store.ensure_bucket().await.expect("ensure bucket");
        pipeline.install_store(store);

        Self {
            pipeline,
            metadata,
            temp_dir,
            store_dir,
        }
    }

    /// A second handle on the backing directory, for inspecting stored objects.
    pub async fn store(&self) -> FilesystemBackend {
        FilesystemBackend::new(self.store_dir.path().to_path_buf(), None)
            .await
            .expect("filesystem store")
    }

    /// Files currently in the temp tree.
    pub fn temp_files(&self) -> Vec<PathBuf> {
        files_under(self.temp_dir.path())
    }
}

fn plain_store(fs: FilesystemBackend) -> Box<dyn ObjectStore> {
    Box::new(fs)
}

fn sqlite_metadata(metadata: SqliteMetadataStore) -> Arc<dyn MetadataStore> {
    Arc::new(metadata)
}

// === Binary test server ===

/// Test server wrapper that spawns a real receipt_ingest binary
pub struct TestServer {
    process: Child,
    port: u16,
    dir: TempDir,
}

impl TestServer {
    /// Start a test server with the filesystem backend
    pub async fn filesystem() -> Self {
        Self::spawn_with_config("").await
    }

    /// Start a test server with extra top-level TOML settings
    pub async fn filesystem_with(extra: &str) -> Self {
        Self::spawn_with_config(extra).await
    }

    /// Start a test server whose backend cannot be created
    pub async fn without_store() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let backend = "[backend]\ntype = \"s3\"\nbucket = \"unused\"\n";
        Self::spawn(dir, "", backend).await
    }

    async fn spawn_with_config(extra: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let backend = format!(
            "[backend]\ntype = \"filesystem\"\npath = \"{}\"\n",
            dir.path().join("objects").display()
        );
        Self::spawn(dir, extra, &backend).await
    }

    /// Allocate a port, write a TOML config, spawn the server and wait for
    /// readiness. All factory methods delegate here.
    async fn spawn(dir: TempDir, extra: &str, backend: &str) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);

        let config = format!(
            "listen_addr = \"127.0.0.1:{}\"\ntemp_dir = \"{}\"\ndatabase_path = \"{}\"\n{}\n{}",
            port,
            dir.path().join("tmp").display(),
            dir.path().join("meta.db").display(),
            extra,
            backend
        );
        let config_path = dir.path().join("test.toml");
        std::fs::write(&config_path, &config).expect("Failed to write test config");

        let process = Command::new(env!("CARGO_BIN_EXE_receipt_ingest"))
            .env("RECEIPT_INGEST_CONFIG", &config_path)
            .env("RUST_LOG", "receipt_ingest=warn")
            .env_remove("RI_S3_ENDPOINT")
            .env_remove("RI_S3_BUCKET")
            .env_remove("RI_S3_ACCESS_KEY_ID")
            .env_remove("RI_S3_SECRET_ACCESS_KEY")
            .env_remove("AWS_ACCESS_KEY_ID")
            .env_remove("AWS_SECRET_ACCESS_KEY")
            .spawn()
            .expect("Failed to start server");

        let mut server = Self { process, port, dir };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }

            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("Server exited before becoming ready: {}", status);
            }

            sleep(Duration::from_millis(100)).await;
        }

        let _ = self.process.kill();
        panic!("Timed out waiting for server on {}", addr);
    }

    /// Get the HTTP endpoint URL
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.dir.path().join("objects")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

// === Shared HTTP helpers (reqwest) ===

/// PUT one chunk and return the response.
pub async fn put_chunk(
    client: &reqwest::Client,
    endpoint: &str,
    user: u64,
    filename: &str,
    index: u32,
    total: u32,
    chunk_size: usize,
    data: Vec<u8>,
) -> reqwest::Response {
    let url = format!(
        "{}/v1/files/{}/chunks/{}?total={}&chunk_size={}",
        endpoint, filename, index, total, chunk_size
    );
    client
        .put(&url)
        .header("x-user-id", user.to_string())
        .body(data)
        .send()
        .await
        .expect("PUT failed")
}

// === MinIO gating ===

/// Create an S3 client pointing directly at MinIO
pub async fn minio_client() -> Client {
    let credentials = Credentials::new(MINIO_ACCESS_KEY, MINIO_SECRET_KEY, None, None, "test");
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(MINIO_ENDPOINT)
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    Client::from_conf(config)
}

/// Check if MinIO is reachable (TCP connect + ListBuckets with 2s timeout)
pub async fn minio_available() -> bool {
    if std::net::TcpStream::connect("localhost:9000").is_err() {
        return false;
    }

    let client = minio_client().await;
    let result =
        tokio::time::timeout(Duration::from_secs(2), client.list_buckets().send()).await;
    matches!(result, Ok(Ok(_)))
}

/// Macro to skip a test if MinIO is not available.
#[macro_export]
macro_rules! skip_unless_minio {
    () => {
        if !common::minio_available().await {
            eprintln!("MinIO not available, skipping test");
            return;
        }
    };
}
