//! P1 Edge Library
//!
//! This library provides the components of the HomeWizard P1 edge daemon:
//!
//! - **config**: Environment-based configuration
//! - **sample**: Sample records and meter reading normalization
//! - **spool**: Durable SQLite FIFO of samples awaiting upload
//! - **backoff**: Exponential backoff for upload retries
//! - **uploader**: Batched HTTPS delivery with acknowledge-after-success
//! - **delivery**: The upload loop and the shutdown flush
//! - **poller**: HomeWizard Local API client and the poll loop
//! - **health**: Shared health state and the health file
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use p1_edge::config::Config;
//! use p1_edge::spool::Spool;
//! use p1_edge::uploader::{Uploader, UploaderSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let spool = Arc::new(Spool::open(&config.spool_path).expect("Failed to open spool"));
//!     let uploader = Uploader::new(spool, &UploaderSettings::from(&config))
//!         .expect("Failed to create uploader");
//!
//!     let outcome = uploader.upload_batch().await.expect("Spool error");
//!     println!("{outcome:?}");
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod delivery;
pub mod health;
pub mod poller;
pub mod sample;
pub mod spool;
pub mod uploader;

// Re-export commonly used types at crate root for convenience
pub use backoff::BackoffState;
pub use config::{Config, ConfigError, LogFormat};
pub use health::{HealthState, HealthStatus};
pub use poller::{HomeWizardClient, MeterSource};
pub use sample::{IngestBatch, NormalizeError, QueuedSample, RawMeasurement, Sample};
pub use spool::{Spool, StorageError};
pub use uploader::{
    ConfigurationError, HttpTransport, IngestEndpoint, IngestTransport, TransportError,
    UploadOutcome, Uploader, UploaderSettings,
};
