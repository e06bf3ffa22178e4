//! P1 Edge - HomeWizard P1 telemetry daemon
//!
//! Polls a HomeWizard P1 meter on the LAN, commits every reading to a local
//! SQLite spool and uploads batches to the ingest service over HTTPS.
//!
//! ## Features
//!
//! - Durable spool; samples survive restarts and network outages
//! - Batched uploads with exponential backoff
//! - Health file for container healthchecks
//! - Graceful shutdown on SIGINT/SIGTERM with a final flush
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `HW_P1_HOST`, `HW_P1_TOKEN`: meter address and Local API token
//! - `VPS_INGEST_URL`: ingest base URL (https only)
//! - `VPS_DEVICE_TOKEN`: ingest bearer token
//! - `DEVICE_ID`: device identifier (default: `HW_P1_HOST`)
//! - `POLL_INTERVAL_S`: seconds between meter polls (default: 2)
//! - `UPLOAD_INTERVAL_S`: seconds between upload attempts (default: 10)
//! - `BATCH_SIZE`: samples per upload (default: 30)
//! - `SPOOL_PATH`: spool database (default: /data/spool.db)
//! - `HEALTH_FILE_PATH`: health file, empty to disable (default: /data/health.json)
//! - `LOG_FORMAT`: `json` or `compact` (default: json)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use p1_edge::config::{Config, LogFormat};
use p1_edge::delivery::{self, DeliverySettings};
use p1_edge::health::{self, HealthState};
use p1_edge::poller::{self, HomeWizardClient, MeterSource, PollSettings, DEFAULT_POLL_TIMEOUT};
use p1_edge::spool::Spool;
use p1_edge::uploader::{Uploader, UploaderSettings};

#[tokio::main]
async fn main() {
    // Read the format before anything else so startup errors are logged in it
    let log_format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("compact") => LogFormat::Compact,
        _ => LogFormat::Json,
    };
    init_tracing(log_format);

    info!("Starting P1 edge daemon...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                hw_p1_host = %config.hw_p1_host,
                device_id = %config.device_id,
                poll_interval_secs = config.poll_interval.as_secs(),
                upload_interval_secs = config.upload_interval.as_secs(),
                batch_size = config.batch_size,
                spool_path = %config.spool_path.display(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let spool = match Spool::open(&config.spool_path) {
        Ok(spool) => Arc::new(spool),
        Err(e) => {
            error!(path = %config.spool_path.display(), error = %e, "Failed to open spool");
            std::process::exit(1);
        }
    };

    let uploader = match Uploader::new(Arc::clone(&spool), &UploaderSettings::from(&config)) {
        Ok(uploader) => Arc::new(uploader),
        Err(e) => {
            error!(error = %e, "Failed to create uploader");
            std::process::exit(1);
        }
    };

    let meter: Arc<dyn MeterSource> =
        match HomeWizardClient::new(&config.hw_p1_host, config.hw_p1_token.clone(), DEFAULT_POLL_TIMEOUT) {
            Ok(client) => {
                info!(url = %client.url(), "P1 meter client initialized");
                Arc::new(client)
            }
            Err(e) => {
                error!(error = %e, "Failed to create P1 meter client");
                std::process::exit(1);
            }
        };

    let health = Arc::new(HealthState::new());
    let cancel = CancellationToken::new();

    let poll_handle = tokio::spawn(poller::run_poll_loop(
        meter,
        Arc::clone(&spool),
        Arc::clone(&health),
        PollSettings {
            device_id: config.device_id.clone(),
            poll_interval: config.poll_interval,
        },
        cancel.clone(),
    ));

    let upload_handle = tokio::spawn(delivery::run_upload_loop(
        Arc::clone(&uploader),
        Arc::clone(&health),
        DeliverySettings {
            upload_interval: config.upload_interval,
            health_file: config.health_file_path.clone(),
        },
        cancel.clone(),
    ));

    info!("P1 edge daemon running");
    shutdown_signal().await;

    info!("Initiating graceful shutdown...");
    cancel.cancel();

    join_task("Poll", poll_handle, config.shutdown_timeout).await;
    join_task("Upload", upload_handle, config.shutdown_timeout).await;

    delivery::flush(&uploader).await;

    if let Some(path) = &config.health_file_path {
        health::report(path, &health, &uploader).await;
    }

    if let Err(e) = spool.close() {
        warn!(error = %e, "Failed to close spool cleanly");
    }

    info!("P1 edge daemon stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Wait for a task to stop, giving up after `shutdown_timeout`.
async fn join_task(name: &str, handle: JoinHandle<()>, shutdown_timeout: Duration) {
    match tokio::time::timeout(shutdown_timeout, handle).await {
        Ok(Ok(())) => info!(task = name, "Task shut down gracefully"),
        Ok(Err(e)) => warn!(task = name, error = %e, "Task panicked during shutdown"),
        Err(_) => warn!(task = name, "Task shutdown timed out after {:?}", shutdown_timeout),
    }
}
