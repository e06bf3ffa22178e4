//! Health module: operational state of the edge daemon.
//!
//! [`HealthState`] is shared by the poll and upload tasks through an `Arc`
//! and records the latest upload result and meter connectivity. A
//! [`HealthStatus`] snapshot combines it with the spool depth and the
//! uploader's backoff, and can be written to a JSON file that a container
//! healthcheck inspects.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::uploader::Uploader;

#[derive(Debug, Default)]
struct HealthInner {
    last_upload_ok: Option<bool>,
    last_upload_at: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    p1_connected: Option<bool>,
}

/// Shared, read-mostly record of recent outcomes.
#[derive(Debug, Default)]
pub struct HealthState {
    inner: Mutex<HealthInner>,
}

/// Point-in-time health report, serialized into the health file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Pending samples, `None` if the spool could not be counted
    pub spool_depth: Option<u64>,

    /// Result of the most recent upload attempt that sent data
    pub last_upload_success: Option<bool>,

    /// Seconds since that attempt, rounded to 0.1 s
    pub last_upload_elapsed_s: Option<f64>,

    pub last_success_at: Option<DateTime<Utc>>,

    pub last_failure_at: Option<DateTime<Utc>>,

    /// Whether the last meter poll returned a reading
    pub p1_connected: Option<bool>,

    /// Uploader backoff in seconds
    pub current_backoff_s: f64,

    pub checked_at: DateTime<Utc>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload_success(&self) {
        let mut inner = self.lock();
        inner.last_upload_ok = Some(true);
        inner.last_upload_at = Some(Instant::now());
        inner.last_success_at = Some(Utc::now());
    }

    pub fn record_upload_failure(&self) {
        let mut inner = self.lock();
        inner.last_upload_ok = Some(false);
        inner.last_upload_at = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
    }

    pub fn record_p1_connected(&self, connected: bool) {
        self.lock().p1_connected = Some(connected);
    }

    /// Build a snapshot from the recorded state plus the given readings.
    pub fn snapshot(&self, spool_depth: Option<u64>, current_backoff: Duration) -> HealthStatus {
        let inner = self.lock();
        HealthStatus {
            spool_depth,
            last_upload_success: inner.last_upload_ok,
            last_upload_elapsed_s: inner
                .last_upload_at
                .map(|at| (at.elapsed().as_secs_f64() * 10.0).round() / 10.0),
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            p1_connected: inner.p1_connected,
            current_backoff_s: current_backoff.as_secs_f64(),
            checked_at: Utc::now(),
        }
    }

    /// Snapshot using live readings from the uploader and its spool.
    pub async fn status(&self, uploader: &Uploader) -> HealthStatus {
        let spool_depth = match uploader.spool().count_async().await {
            Ok(depth) => Some(depth),
            Err(e) => {
                warn!(error = %e, "Health check: failed to read spool count");
                None
            }
        };
        self.snapshot(spool_depth, uploader.current_backoff())
    }

    fn lock(&self) -> MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write `status` as JSON to `path`, replacing the file atomically.
pub fn write_health_file(path: &Path, status: &HealthStatus) -> io::Result<()> {
    let json = serde_json::to_vec(status)?;
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Refresh the health file; failures are logged, never returned.
pub async fn report(path: &Path, health: &HealthState, uploader: &Uploader) {
    let status = health.status(uploader).await;
    let target = path.to_path_buf();
    match tokio::task::spawn_blocking(move || write_health_file(&target, &status)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "Health check: failed to write health file")
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Health check: write task failed"),
    }
}
