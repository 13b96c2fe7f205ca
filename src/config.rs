//! Configuration for the receipt ingestion service

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root for raw chunk files and processed images. Swept at startup.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// SQLite database for file records and upload intents.
    /// `:memory:` keeps everything in process memory.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Leading path segment of every object key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Largest accepted chunk body in bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Largest declared upload (`total * chunk_size`) in bytes
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Requests handled at once; further requests wait
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Deadline for the transform and for the object store upload
    #[serde(default = "default_stage_timeout", with = "duration_str")]
    pub stage_timeout: Duration,

    /// Sessions idle for longer than this are evicted with their temp file
    #[serde(default = "default_session_ttl", with = "duration_str")]
    pub session_ttl: Duration,

    /// How long chunks for a just-stored upload are refused
    #[serde(default = "default_completed_grace", with = "duration_str")]
    pub completed_grace: Duration,

    /// Lifetime of download URLs returned by the file listing
    #[serde(default = "default_presign_ttl", with = "duration_str")]
    pub presign_ttl: Duration,

    /// Upload intents older than this are treated as abandoned
    #[serde(default = "default_reconcile_after", with = "duration_str")]
    pub reconcile_after: Duration,

    /// Period of the background expiry and reconcile task
    #[serde(default = "default_janitor_interval", with = "duration_str")]
    pub janitor_interval: Duration,

    /// Log level filter string. Overridden by RUST_LOG.
    /// Default: "receipt_ingest=debug,tower_http=debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Object store configuration
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Objects stored as files under a local directory
    Filesystem {
        /// Directory for object data
        path: PathBuf,

        /// Base URL under which `path` is served, if any
        #[serde(default)]
        public_base_url: Option<String>,
    },

    /// S3-compatible object store (AWS, MinIO)
    S3 {
        /// Endpoint URL for MinIO or other S3-compatible services.
        /// If not specified, uses the AWS default endpoint.
        #[serde(default)]
        endpoint: Option<String>,

        #[serde(default = "default_region")]
        region: String,

        #[serde(default = "default_bucket")]
        bucket: String,

        /// Use path-style URLs (required for MinIO)
        #[serde(default = "default_force_path_style")]
        force_path_style: bool,

        #[serde(default)]
        access_key_id: Option<String>,

        #[serde(default)]
        secret_access_key: Option<String>,

        /// Base URL for object references. Defaults to `<endpoint>/<bucket>`.
        #[serde(default)]
        public_base_url: Option<String>,
    },
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./uploads_temp")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./receipt_ingest.db")
}

fn default_key_prefix() -> String {
    "upload".to_string()
}

fn default_max_chunk_size() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_max_upload_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_stage_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_completed_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_presign_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_reconcile_after() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_janitor_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_bucket() -> String {
    "receipts".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_log_level() -> String {
    "receipt_ingest=debug,tower_http=debug".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            path: PathBuf::from("./data"),
            public_base_url: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            temp_dir: default_temp_dir(),
            database_path: default_database_path(),
            key_prefix: default_key_prefix(),
            max_chunk_size: default_max_chunk_size(),
            max_upload_size: default_max_upload_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
            stage_timeout: default_stage_timeout(),
            session_ttl: default_session_ttl(),
            completed_grace: default_completed_grace(),
            presign_ttl: default_presign_ttl(),
            reconcile_after: default_reconcile_after(),
            janitor_interval: default_janitor_interval(),
            log_level: default_log_level(),
            backend: BackendConfig::default(),
        }
    }
}

/// Humantime strings ("10s", "1h 30m") for duration fields.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_duration(name: &str) -> Option<Duration> {
    env_var(name).and_then(|v| humantime::parse_duration(&v).ok())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `RI_*` environment variables onto this configuration.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(addr) = env_parse("RI_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(dir) = env_var("RI_TEMP_DIR") {
            self.temp_dir = PathBuf::from(dir);
        }
        if let Some(db) = env_var("RI_DATABASE_PATH") {
            self.database_path = PathBuf::from(db);
        }
        if let Some(prefix) = env_var("RI_KEY_PREFIX") {
            self.key_prefix = prefix;
        }
        if let Some(size) = env_parse("RI_MAX_CHUNK_SIZE") {
            self.max_chunk_size = size;
        }
        if let Some(size) = env_parse("RI_MAX_UPLOAD_SIZE") {
            self.max_upload_size = size;
        }
        if let Some(limit) = env_parse("RI_MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = limit;
        }
        if let Some(d) = env_duration("RI_STAGE_TIMEOUT") {
            self.stage_timeout = d;
        }
        if let Some(d) = env_duration("RI_SESSION_TTL") {
            self.session_ttl = d;
        }
        if let Some(d) = env_duration("RI_COMPLETED_GRACE") {
            self.completed_grace = d;
        }
        if let Some(d) = env_duration("RI_PRESIGN_TTL") {
            self.presign_ttl = d;
        }
        if let Some(d) = env_duration("RI_RECONCILE_AFTER") {
            self.reconcile_after = d;
        }
        if let Some(d) = env_duration("RI_JANITOR_INTERVAL") {
            self.janitor_interval = d;
        }
        if let Some(level) = env_var("RI_LOG_LEVEL") {
            self.log_level = level;
        }

        // Backend selection
        if env_var("RI_S3_ENDPOINT").is_some() || env_var("RI_S3_BUCKET").is_some() {
            self.backend = BackendConfig::S3 {
                endpoint: env_var("RI_S3_ENDPOINT"),
                region: env_var("RI_S3_REGION").unwrap_or_else(default_region),
                bucket: env_var("RI_S3_BUCKET").unwrap_or_else(default_bucket),
                force_path_style: env_var("RI_S3_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
                access_key_id: env_var("RI_S3_ACCESS_KEY_ID"),
                secret_access_key: env_var("RI_S3_SECRET_ACCESS_KEY"),
                public_base_url: env_var("RI_PUBLIC_BASE_URL"),
            };
        } else if let Some(dir) = env_var("RI_DATA_DIR") {
            self.backend = BackendConfig::Filesystem {
                path: PathBuf::from(dir),
                public_base_url: env_var("RI_PUBLIC_BASE_URL"),
            };
        }
    }

    /// Load from `RECEIPT_INGEST_CONFIG` or a default location, falling back
    /// to defaults, then overlay the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file()?.unwrap_or_default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn load_file() -> Result<Option<Self>, ConfigError> {
        if let Some(path) = env_var("RECEIPT_INGEST_CONFIG") {
            return Self::from_file(&path).map(Some);
        }

        for path in &["receipt_ingest.toml", "/etc/receipt_ingest/config.toml"] {
            if std::path::Path::new(path).exists() {
                return Self::from_file(path).map(Some);
            }
        }
        Ok(None)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("max_chunk_size must be positive".into()));
        }
        if self.max_upload_size < self.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "max_upload_size {} is smaller than max_chunk_size {}",
                self.max_upload_size, self.max_chunk_size
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be positive".into(),
            ));
        }
        if self.stage_timeout.is_zero() {
            return Err(ConfigError::Invalid("stage_timeout must be positive".into()));
        }
        if self.janitor_interval.is_zero() {
            return Err(ConfigError::Invalid("janitor_interval must be positive".into()));
        }
        if self.key_prefix.split('/').any(|seg| seg == "..") {
            return Err(ConfigError::Invalid(format!(
                "key_prefix must not contain '..': {}",
                self.key_prefix
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
