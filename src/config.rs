//! Configuration module for the P1 edge daemon.
//!
//! This module loads the daemon configuration from environment variables:
//! meter access, ingest endpoint and token, cadences, batch size and local
//! file locations.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::uploader::IngestEndpoint;

/// Default poll interval in seconds
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Default upload interval in seconds
const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 10;

/// Default batch size (number of samples per upload)
const DEFAULT_BATCH_SIZE: usize = 30;

/// Maximum allowed batch size
const MAX_BATCH_SIZE: usize = 1000;

/// Default cap on upload backoff in seconds
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Longest request timeout accepted
const MAX_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default per-task join timeout at shutdown, in seconds
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

const DEFAULT_SPOOL_PATH: &str = "/data/spool.db";

const DEFAULT_HEALTH_FILE_PATH: &str = "/data/health.json";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,

    /// Human-readable single-line output
    Compact,
}

/// Configuration for the edge daemon.
///
/// All settings can be configured via environment variables:
/// - `HW_P1_HOST`, `HW_P1_TOKEN`: meter address and Local API token (required)
/// - `VPS_INGEST_URL`: ingest base URL, must be https (required)
/// - `VPS_DEVICE_TOKEN`: bearer token for the ingest service (required)
/// - `DEVICE_ID`: device identifier (default: `HW_P1_HOST`)
/// - `POLL_INTERVAL_S`, `UPLOAD_INTERVAL_S`: cadences (default: 2, 10)
/// - `BATCH_SIZE`: samples per upload (default: 30)
/// - `MAX_BACKOFF_S`, `REQUEST_TIMEOUT_S`, `SHUTDOWN_TIMEOUT_S`
/// - `SPOOL_PATH`, `HEALTH_FILE_PATH`, `LOG_FORMAT`
#[derive(Debug, Clone)]
pub struct Config {
    /// HomeWizard P1 meter IP or hostname on the LAN
    pub hw_p1_host: String,

    /// HomeWizard Local API bearer token
    pub hw_p1_token: String,

    /// Base URL of the ingest service
    pub vps_ingest_url: String,

    /// Per-device bearer token for the ingest service
    pub vps_device_token: String,

    /// Identifier stamped on every sample
    pub device_id: String,

    /// Time between meter polls
    pub poll_interval: Duration,

    /// Baseline time between upload attempts
    pub upload_interval: Duration,

    /// Maximum samples per upload request
    pub batch_size: usize,

    /// Cap on the upload backoff
    pub max_backoff: Duration,

    /// HTTP request timeout for uploads
    pub request_timeout: Duration,

    /// How long to wait for each task to stop at shutdown
    pub shutdown_timeout: Duration,

    /// SQLite spool file
    pub spool_path: PathBuf,

    /// Health file location; `None` disables it
    pub health_file_path: Option<PathBuf>,

    /// Log output format
    pub log_format: LogFormat,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error{}: {message}", .env_var.as_ref().map(|v| format!(" for {v}")).unwrap_or_default())]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing, a number
    /// does not parse or falls outside its range, or `VPS_INGEST_URL` is
    /// not an https URL.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use p1_edge::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Spool: {}", config.spool_path.display());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let hw_p1_host = vars.required("HW_P1_HOST")?;
        let hw_p1_token = vars.required("HW_P1_TOKEN")?;

        let vps_ingest_url = vars.required("VPS_INGEST_URL")?;
        IngestEndpoint::parse(&vps_ingest_url)
            .map_err(|e| ConfigError::new("VPS_INGEST_URL", e.to_string()))?;
        let vps_ingest_url = vps_ingest_url.trim_end_matches('/').to_string();

        let vps_device_token = vars.required("VPS_DEVICE_TOKEN")?;

        let device_id = vars
            .optional("DEVICE_ID")
            .unwrap_or_else(|| hw_p1_host.clone());

        let poll_interval = vars.seconds("POLL_INTERVAL_S", DEFAULT_POLL_INTERVAL_SECS, 1, u64::MAX)?;
        let upload_interval =
            vars.seconds("UPLOAD_INTERVAL_S", DEFAULT_UPLOAD_INTERVAL_SECS, 1, u64::MAX)?;
        let max_backoff = vars.seconds("MAX_BACKOFF_S", DEFAULT_MAX_BACKOFF_SECS, 1, u64::MAX)?;
        let request_timeout = vars.seconds(
            "REQUEST_TIMEOUT_S",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            MAX_REQUEST_TIMEOUT_SECS,
        )?;
        let shutdown_timeout =
            vars.seconds("SHUTDOWN_TIMEOUT_S", DEFAULT_SHUTDOWN_TIMEOUT_SECS, 1, u64::MAX)?;

        let batch_size = vars.number("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::new(
                "BATCH_SIZE",
                format!("batch size {batch_size} must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }

        let spool_path = PathBuf::from(
            vars.optional("SPOOL_PATH")
                .unwrap_or_else(|| DEFAULT_SPOOL_PATH.to_string()),
        );

        let health_file_path = match (vars.lookup)("HEALTH_FILE_PATH") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(PathBuf::from(value.trim())),
            None => Some(PathBuf::from(DEFAULT_HEALTH_FILE_PATH)),
        };

        let log_format = match vars.optional("LOG_FORMAT").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("compact") => LogFormat::Compact,
            Some(other) => {
                return Err(ConfigError::new(
                    "LOG_FORMAT",
                    format!("'{other}' is not one of: json, compact"),
                ))
            }
        };

        Ok(Self {
            hw_p1_host,
            hw_p1_token,
            vps_ingest_url,
            vps_device_token,
            device_id,
            poll_interval,
            upload_interval,
            batch_size,
            max_backoff,
            request_timeout,
            shutdown_timeout,
            spool_path,
            health_file_path,
            log_format,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value or `None`.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::new(key, "is required but not set"))
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::new(key, format!("'{value}' is not a valid number"))),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &str, default: u64, min: u64, max: u64) -> Result<Duration, ConfigError> {
        let secs = self.number(key, default)?;
        if secs < min {
            return Err(ConfigError::new(
                key,
                format!("{secs}s is below minimum ({min}s)"),
            ));
        }
        if secs > max {
            return Err(ConfigError::new(
                key,
                format!("{secs}s exceeds maximum ({max}s)"),
            ));
        }
        Ok(Duration::from_secs(secs))
    }
}
