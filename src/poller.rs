//! Poller module: reads the HomeWizard P1 meter and feeds the spool.
//!
//! The meter is queried over its Local API on the LAN. Every reading is
//! normalized and committed to the spool before anything else happens to
//! it; a failed poll is logged and simply skipped.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::panic_message;
use crate::health::HealthState;
use crate::sample::{normalize, RawMeasurement};
use crate::spool::Spool;

/// Default timeout for one meter request.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of raw meter readings.
#[async_trait]
pub trait MeterSource: Send + Sync {
    /// Fetch the latest reading, or `None` if the meter could not be read.
    async fn poll(&self) -> Option<RawMeasurement>;
}

/// Client for the HomeWizard P1 Local API.
pub struct HomeWizardClient {
    client: Client,
    url: String,
    token: String,
}

impl HomeWizardClient {
    /// Create a client for the meter at `host`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `reqwest::Error` if the HTTP client cannot be
    /// built.
    pub fn new(host: &str, token: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{}/api/measurement", host.trim_end_matches('/')),
            token: token.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MeterSource for HomeWizardClient {
    async fn poll(&self) -> Option<RawMeasurement> {
        let response = match self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(url = %self.url, error = %e, "P1 poll timeout");
                return None;
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "P1 poll connection error");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "P1 poll HTTP error");
            return None;
        }

        match response.json::<RawMeasurement>().await {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(url = %self.url, error = %e, "P1 poll returned an unreadable body");
                None
            }
        }
    }
}

/// Settings for the poll loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Device identifier stamped on every sample
    pub device_id: String,

    /// Time between polls
    pub poll_interval: Duration,
}

/// Result of one poll iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Spooled,
    MeterUnavailable,
    Rejected,
}

/// Poll, normalize and spool once.
pub async fn poll_once(
    source: &dyn MeterSource,
    spool: &Arc<Spool>,
    health: &HealthState,
    device_id: &str,
) -> PollResult {
    let Some(raw) = source.poll().await else {
        health.record_p1_connected(false);
        return PollResult::MeterUnavailable;
    };
    health.record_p1_connected(true);

    let sample = match normalize(&raw, device_id, Utc::now()) {
        Ok(sample) => sample,
        Err(e) => {
            warn!(error = %e, "Discarding malformed meter reading");
            return PollResult::Rejected;
        }
    };

    let power_w = sample.power_w;
    if let Err(e) = spool.enqueue_async(sample).await {
        error!(error = %e, "Failed to spool sample");
        return PollResult::Rejected;
    }

    match spool.count_async().await {
        Ok(depth) => debug!(spool_depth = depth, power_w = power_w, "Enqueued sample"),
        Err(e) => debug!(error = %e, "Enqueued sample, spool depth unavailable"),
    }
    PollResult::Spooled
}

/// Run the poll loop until `cancel` fires.
pub async fn run_poll_loop(
    source: Arc<dyn MeterSource>,
    spool: Arc<Spool>,
    health: Arc<HealthState>,
    settings: PollSettings,
    cancel: CancellationToken,
) {
    info!(
        device_id = %settings.device_id,
        poll_interval_secs = settings.poll_interval.as_secs_f64(),
        "Poll loop started"
    );
    let mut samples_spooled: u64 = 0;

    while !cancel.is_cancelled() {
        let attempt = AssertUnwindSafe(poll_once(
            source.as_ref(),
            &spool,
            &health,
            &settings.device_id,
        ))
        .catch_unwind()
        .await;

        match attempt {
            Ok(PollResult::Spooled) => samples_spooled += 1,
            Ok(_) => {}
            Err(panic) => {
                health.record_p1_connected(false);
                error!(panic = panic_message(&*panic), "Unexpected error in poll loop");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    info!(samples_spooled = samples_spooled, "Poll loop stopped");
}
