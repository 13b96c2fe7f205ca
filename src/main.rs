//! Receipt Ingest - chunked receipt upload server

use clap::Parser;
use receipt_ingest::api::{self, handlers::AppState};
use receipt_ingest::config::{BackendConfig, Config};
use receipt_ingest::janitor;
use receipt_ingest::metadata::SqliteMetadataStore;
use receipt_ingest::pipeline::{IngestPipeline, PipelineSettings};
use receipt_ingest::storage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Receipt Ingest - resumable chunked uploads with grayscale processing
#[derive(Parser, Debug)]
#[command(name = "receipt_ingest")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = if let Some(ref path) = cli.config {
        let mut config = Config::from_file(path)?;
        config.apply_env();
        config.validate()?;
        config
    } else {
        Config::load()?
    };
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let log_level = if cli.verbose {
        "receipt_ingest=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Receipt Ingest server");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Temp directory: {:?}", config.temp_dir);
    info!("  Database: {:?}", config.database_path);
    info!("  Key prefix: {}", config.key_prefix);
    info!(
        "  Max chunk size: {} KB",
        config.max_chunk_size / 1024
    );
    info!(
        "  Stage timeout: {}",
        humantime::format_duration(config.stage_timeout)
    );
    match &config.backend {
        BackendConfig::Filesystem { path, .. } => {
            info!("  Backend: Filesystem");
            info!("  Data directory: {:?}", path);
        }
        BackendConfig::S3 {
            endpoint,
            bucket,
            region,
            ..
        } => {
            info!("  Backend: S3");
            info!("  Bucket: {}", bucket);
            info!("  Region: {}", region);
            if let Some(ep) = endpoint {
                info!("  Endpoint: {}", ep);
            }
        }
    }

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let metadata = SqliteMetadataStore::open(&config.database_path)?;
    let pipeline = Arc::new(IngestPipeline::new(
        PipelineSettings::from(&config),
        Arc::new(metadata),
    ));

    // Sessions do not survive a restart; their partial files are garbage.
    match pipeline.sweep_temp_root().await {
        Ok(0) => {}
        Ok(n) => warn!("Removed {} leftover temp entries from a previous run", n),
        Err(e) => {
            error!("Temp directory {:?} is unusable: {}", config.temp_dir, e);
            return Err(e.into());
        }
    }

    // Without a store the server still starts; uploads report not_initialized.
    match storage::build_backend(&config.backend).await {
        Ok(store) => match store.ensure_bucket().await {
            Ok(()) => {
                pipeline.install_store(store);
                match pipeline.reconcile_intents(config.reconcile_after).await {
                    Ok(resolved) if !resolved.is_empty() => {
                        info!("Reconciled {} stale upload intents", resolved.len())
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Startup reconciliation failed: {}", e),
                }
            }
            Err(e) => error!("Object store is not ready: {}", e),
        },
        Err(e) => error!("Could not create object store client: {}", e),
    }

    let janitor = janitor::spawn(Arc::clone(&pipeline), config.janitor_interval);

    let state = Arc::new(AppState {
        pipeline: Arc::clone(&pipeline),
    });
    let app = api::router(state, config.max_chunk_size, config.max_concurrent_requests);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Receipt Ingest listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    janitor.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
