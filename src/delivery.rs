//! Delivery loop: drives the uploader on a cadence until shutdown.
//!
//! Each iteration runs one [`Uploader::upload_batch`], turns the outcome
//! into the next wait interval and then waits on either the timer or the
//! shared [`CancellationToken`]. Storage errors and panics raised inside an
//! iteration are logged and count as a missed cycle; only cancellation ends
//! the loop.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::{self, HealthState};
use crate::uploader::{UploadOutcome, Uploader};

/// Settings for the upload loop.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Baseline cadence between upload attempts
    pub upload_interval: Duration,

    /// Health file rewritten after every iteration, if set
    pub health_file: Option<PathBuf>,
}

/// How an iteration ended, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    Delivered,
    Idle,
    Failed,
}

impl From<&UploadOutcome> for CycleResult {
    fn from(outcome: &UploadOutcome) -> Self {
        match outcome {
            UploadOutcome::Success { .. } => CycleResult::Delivered,
            UploadOutcome::NoOp => CycleResult::Idle,
            UploadOutcome::Failure(_) => CycleResult::Failed,
        }
    }
}

/// Wait before the next attempt.
///
/// The configured interval is a floor: after a failure the loop waits
/// `max(upload_interval, current_backoff)`, never less than the cadence.
pub fn next_wait(result: CycleResult, upload_interval: Duration, current_backoff: Duration) -> Duration {
    match result {
        CycleResult::Delivered | CycleResult::Idle => upload_interval,
        CycleResult::Failed => upload_interval.max(current_backoff),
    }
}

/// Run the upload loop until `cancel` fires.
pub async fn run_upload_loop(
    uploader: Arc<Uploader>,
    health: Arc<HealthState>,
    settings: DeliverySettings,
    cancel: CancellationToken,
) {
    info!(
        upload_interval_secs = settings.upload_interval.as_secs_f64(),
        batch_size = uploader.batch_size(),
        "Upload loop started"
    );
    let mut cycles: u64 = 0;

    while !cancel.is_cancelled() {
        cycles += 1;
        let result = run_cycle(&uploader, &health).await;

        if let Some(path) = &settings.health_file {
            health::report(path, &health, &uploader).await;
        }

        let delay = next_wait(result, settings.upload_interval, uploader.current_backoff());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(cycles = cycles, "Upload loop stopped");
}

/// One guarded iteration; nothing escapes it.
async fn run_cycle(uploader: &Uploader, health: &HealthState) -> CycleResult {
    let attempt = AssertUnwindSafe(uploader.upload_batch()).catch_unwind().await;

    match attempt {
        Ok(Ok(outcome)) => {
            let result = CycleResult::from(&outcome);
            match result {
                CycleResult::Delivered => health.record_upload_success(),
                CycleResult::Failed => health.record_upload_failure(),
                CycleResult::Idle => {}
            }
            result
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Spool error during upload cycle, will retry next tick");
            health.record_upload_failure();
            CycleResult::Failed
        }
        Err(panic) => {
            error!(panic = panic_message(&*panic), "Unexpected error in upload loop");
            health.record_upload_failure();
            CycleResult::Failed
        }
    }
}

/// Attempt one last upload before the process exits.
///
/// Errors and panics are logged and swallowed so shutdown is never blocked
/// by a failing flush.
pub async fn flush(uploader: &Uploader) -> Option<UploadOutcome> {
    info!("Flushing pending uploads before shutdown");
    match AssertUnwindSafe(uploader.upload_batch()).catch_unwind().await {
        Ok(Ok(outcome)) => {
            match &outcome {
                UploadOutcome::Success { delivered } => {
                    info!(delivered = delivered, "Final upload flush succeeded")
                }
                UploadOutcome::NoOp => info!("No pending samples to flush"),
                UploadOutcome::Failure(e) => warn!(error = %e, "Final upload flush failed"),
            }
            Some(outcome)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Error during final upload flush");
            None
        }
        Err(panic) => {
            error!(panic = panic_message(&*panic), "Error during final upload flush");
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
