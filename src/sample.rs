//! Sample module for energy-meter measurements.
//!
//! This module defines the normalized sample shape shared by the poller,
//! the spool and the uploader, plus the pure normalization step that turns
//! a raw HomeWizard P1 reading into a [`Sample`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single normalized measurement.
///
/// This is exactly the shape the ingest service accepts; serialized field
/// names match the remote contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Identifier of the P1 meter the reading came from
    pub device_id: String,

    /// Measurement time, ISO-8601 with explicit offset
    pub ts: String,

    /// Net active power in watts (negative while exporting)
    pub power_w: i64,

    /// Imported power in watts, never negative
    pub import_power_w: i64,

    /// Cumulative imported energy counter
    #[serde(default)]
    pub energy_import_kwh: Option<f64>,

    /// Cumulative exported energy counter
    #[serde(default)]
    pub energy_export_kwh: Option<f64>,
}

impl Sample {
    /// Create a sample with only the required fields set.
    pub fn new(device_id: impl Into<String>, ts: impl Into<String>, power_w: i64) -> Self {
        Self {
            device_id: device_id.into(),
            ts: ts.into(),
            power_w,
            import_power_w: power_w.max(0),
            energy_import_kwh: None,
            energy_export_kwh: None,
        }
    }

    /// Attach cumulative energy counters.
    pub fn with_energy(mut self, import_kwh: f64, export_kwh: f64) -> Self {
        self.energy_import_kwh = Some(import_kwh);
        self.energy_export_kwh = Some(export_kwh);
        self
    }
}

/// A sample persisted in the spool, together with its queue metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSample {
    /// Queue-assigned identity; strictly increasing and never reused
    pub sequence_id: i64,

    /// The domain payload
    pub sample: Sample,

    /// Queue-assigned insertion time
    pub enqueued_at: String,
}

/// Request body for the ingest endpoint.
///
/// Borrows the samples from peeked spool rows so the queue metadata
/// (`sequence_id`, `enqueued_at`) never reaches the wire.
#[derive(Debug, Serialize)]
pub struct IngestBatch<'a> {
    pub samples: Vec<&'a Sample>,
}

impl<'a> IngestBatch<'a> {
    /// Build a batch from spool rows, preserving their order.
    pub fn from_queued(rows: &'a [QueuedSample]) -> Self {
        Self {
            samples: rows.iter().map(|row| &row.sample).collect(),
        }
    }

    /// Get the number of samples in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Raw reading as returned by the HomeWizard P1 Local API.
///
/// Every field is optional here so that missing keys can be reported
/// together by [`normalize`] instead of failing on the first one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMeasurement {
    #[serde(default)]
    pub power_w: Option<f64>,

    #[serde(default)]
    pub energy_import_kwh: Option<f64>,

    #[serde(default)]
    pub energy_export_kwh: Option<f64>,
}

/// Errors raised while normalizing a raw reading.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    /// One or more required fields were absent (sorted by name)
    #[error("raw measurement is missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Normalize a raw meter reading into a [`Sample`].
///
/// Pure: the timestamp is injected by the caller. Fractional watts are
/// rounded to the nearest integer and `import_power_w` is `max(power_w, 0)`.
///
/// # Errors
///
/// Returns [`NormalizeError::MissingFields`] listing every missing
/// required field.
pub fn normalize(
    raw: &RawMeasurement,
    device_id: &str,
    ts: DateTime<Utc>,
) -> Result<Sample, NormalizeError> {
    let mut missing = Vec::new();
    if raw.energy_export_kwh.is_none() {
        missing.push("energy_export_kwh");
    }
    if raw.energy_import_kwh.is_none() {
        missing.push("energy_import_kwh");
    }
    if raw.power_w.is_none() {
        missing.push("power_w");
    }

    match (raw.power_w, raw.energy_import_kwh, raw.energy_export_kwh) {
        (Some(power_w), Some(import_kwh), Some(export_kwh)) => {
            let power_w = power_w.round() as i64;
            Ok(Sample {
                device_id: device_id.to_string(),
                ts: ts.to_rfc3339_opts(SecondsFormat::Micros, false),
                power_w,
                import_power_w: power_w.max(0),
                energy_import_kwh: Some(import_kwh),
                energy_export_kwh: Some(export_kwh),
            })
        }
        _ => Err(NormalizeError::MissingFields(missing)),
    }
}
