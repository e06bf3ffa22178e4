//! Uploader module: drains the spool into the ingest service.
//!
//! The uploader peeks a bounded batch from the [`Spool`], posts it to
//! `{ingest_base_url}/v1/ingest` and acknowledges exactly the rows it sent,
//! and only after a 2xx response. Any transport failure leaves the batch in
//! the spool and grows the backoff delay.
//!
//! The network is reached through the [`IngestTransport`] trait;
//! [`HttpTransport`] is the production implementation and always talks TLS
//! with certificate validation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffState, BASE_DELAY, DEFAULT_MAX_BACKOFF};
use crate::config::Config;
use crate::sample::IngestBatch;
use crate::spool::{Spool, StorageError};

/// Default number of samples per upload request.
pub const DEFAULT_BATCH_SIZE: usize = 30;

/// Default HTTP request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Path appended to the ingest base URL.
const INGEST_PATH: &str = "v1/ingest";

/// Fatal startup errors raised while building the uploader.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The ingest URL does not use `https://`
    #[error("ingest URL must use https (got scheme '{scheme}')")]
    InsecureScheme { scheme: String },

    /// The ingest URL could not be parsed
    #[error("invalid ingest URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Batches must hold at least one sample
    #[error("batch size must be greater than 0")]
    ZeroBatchSize,

    /// The TLS client could not be constructed
    #[error("failed to build HTTPS client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Errors that can occur while delivering one batch.
///
/// These never escape [`Uploader::upload_batch`]; they are reported inside
/// [`UploadOutcome::Failure`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connect, TLS, body)
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Request timeout
    #[error("request timed out")]
    Timeout,

    /// Server returned a non-2xx status code
    #[error("server error ({code}): {message}")]
    Status { code: StatusCode, message: String },
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// Result of one upload cycle.
#[derive(Debug)]
pub enum UploadOutcome {
    /// The batch was accepted and its rows acknowledged
    Success { delivered: usize },

    /// The spool was empty; nothing was sent
    NoOp,

    /// The batch was not delivered and remains in the spool
    Failure(TransportError),
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, UploadOutcome::Failure(_))
    }
}

/// A validated HTTPS ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestEndpoint {
    url: Url,
}

impl IngestEndpoint {
    /// Validate `base_url` and derive the ingest URL from it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InsecureScheme`] for anything other
    /// than `https`, and [`ConfigurationError::InvalidUrl`] when the URL
    /// cannot be parsed or has no host.
    pub fn parse(base_url: &str) -> Result<Self, ConfigurationError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/")).map_err(|e| ConfigurationError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        if base.scheme() != "https" {
            return Err(ConfigurationError::InsecureScheme {
                scheme: base.scheme().to_string(),
            });
        }
        if base.host_str().map_or(true, str::is_empty) {
            return Err(ConfigurationError::InvalidUrl {
                url: base_url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        let url = base
            .join(INGEST_PATH)
            .map_err(|e| ConfigurationError::InvalidUrl {
                url: base_url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Uploader settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct UploaderSettings {
    /// Base URL of the ingest service (must be https)
    pub ingest_base_url: String,

    /// Bearer token identifying this device
    pub device_token: String,

    /// Maximum samples per request
    pub batch_size: usize,

    /// Cap on the backoff delay
    pub max_backoff: Duration,

    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl UploaderSettings {
    pub fn new(ingest_base_url: impl Into<String>, device_token: impl Into<String>) -> Self {
        Self {
            ingest_base_url: ingest_base_url.into(),
            device_token: device_token.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_backoff: DEFAULT_MAX_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl From<&Config> for UploaderSettings {
    fn from(config: &Config) -> Self {
        Self {
            ingest_base_url: config.vps_ingest_url.clone(),
            device_token: config.vps_device_token.clone(),
            batch_size: config.batch_size,
            max_backoff: config.max_backoff,
            request_timeout: config.request_timeout,
        }
    }
}

/// Network seam used by the uploader to deliver one batch.
#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Deliver the batch. `Ok(())` means the server answered 2xx.
    async fn send(&self, batch: &IngestBatch<'_>) -> Result<(), TransportError>;
}

/// HTTPS transport backed by a pooled `reqwest` client.
///
/// Certificate validation is always on and plain-http redirects are refused.
pub struct HttpTransport {
    client: Client,
    endpoint: IngestEndpoint,
    device_token: String,
}

impl HttpTransport {
    /// Build the TLS client for `endpoint`.
    pub fn new(
        endpoint: IngestEndpoint,
        device_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigurationError> {
        let client = Client::builder()
            .timeout(timeout)
            .https_only(true)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(ConfigurationError::Client)?;

        Ok(Self {
            client,
            endpoint,
            device_token: device_token.into(),
        })
    }

    /// Build the POST for `batch`: bearer token header and JSON body.
    fn request(&self, batch: &IngestBatch<'_>) -> reqwest::Result<reqwest::Request> {
        self.client
            .post(self.endpoint.url().clone())
            .bearer_auth(&self.device_token)
            .json(batch)
            .build()
    }
}

#[async_trait]
impl IngestTransport for HttpTransport {
    async fn send(&self, batch: &IngestBatch<'_>) -> Result<(), TransportError> {
        let request = self.request(batch)?;
        let response = self.client.execute(request).await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(TransportError::Status {
            code: status,
            message,
        })
    }
}

/// Batch uploader with exponential backoff.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use p1_edge::spool::Spool;
/// use p1_edge::uploader::{Uploader, UploaderSettings};
///
/// #[tokio::main]
/// async fn main() {
///     let spool = Arc::new(Spool::open("/data/spool.db").expect("open spool"));
///     let settings = UploaderSettings::new("https://vps.example.com", "device-token");
///     let uploader = Uploader::new(spool, &settings).expect("https endpoint");
///
///     match uploader.upload_batch().await {
///         Ok(outcome) => println!("{outcome:?}"),
///         Err(e) => eprintln!("spool error: {e}"),
///     }
/// }
/// ```
pub struct Uploader {
    spool: Arc<Spool>,
    transport: Box<dyn IngestTransport>,
    batch_size: usize,
    backoff: Mutex<BackoffState>,

    /// Serializes peek-send-ack cycles
    in_flight: tokio::sync::Mutex<()>,
}

impl Uploader {
    /// Create an uploader posting to `settings.ingest_base_url` over HTTPS.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the URL is not https (checked before
    /// any client is built), the batch size is zero, or the TLS client
    /// cannot be constructed.
    pub fn new(spool: Arc<Spool>, settings: &UploaderSettings) -> Result<Self, ConfigurationError> {
        let endpoint = Self::validate(settings)?;
        let transport = HttpTransport::new(
            endpoint,
            settings.device_token.clone(),
            settings.request_timeout,
        )?;
        Ok(Self::assemble(spool, settings, Box::new(transport)))
    }

    /// Create an uploader with a custom transport.
    ///
    /// The ingest URL is still validated so the https requirement cannot be
    /// bypassed by swapping the transport.
    pub fn with_transport(
        spool: Arc<Spool>,
        settings: &UploaderSettings,
        transport: Box<dyn IngestTransport>,
    ) -> Result<Self, ConfigurationError> {
        Self::validate(settings)?;
        Ok(Self::assemble(spool, settings, transport))
    }

    fn validate(settings: &UploaderSettings) -> Result<IngestEndpoint, ConfigurationError> {
        let endpoint = IngestEndpoint::parse(&settings.ingest_base_url)?;
        if settings.batch_size == 0 {
            return Err(ConfigurationError::ZeroBatchSize);
        }
        Ok(endpoint)
    }

    fn assemble(
        spool: Arc<Spool>,
        settings: &UploaderSettings,
        transport: Box<dyn IngestTransport>,
    ) -> Self {
        Self {
            spool,
            transport,
            batch_size: settings.batch_size,
            backoff: Mutex::new(BackoffState::new(BASE_DELAY, settings.max_backoff)),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one upload cycle.
    ///
    /// Returns `NoOp` without touching the network or the backoff state when
    /// the spool is empty. On a 2xx response the sent rows are acknowledged
    /// and the backoff resets; on any transport failure nothing is
    /// acknowledged and the failure streak grows by one.
    ///
    /// # Errors
    ///
    /// Only local spool failures are returned as `Err`. If the ack itself
    /// fails after a confirmed delivery, the rows stay spooled and will be
    /// resent; the server upserts on `(device_id, ts)`.
    pub async fn upload_batch(&self) -> Result<UploadOutcome, StorageError> {
        let _cycle = self.in_flight.lock().await;

        let rows = self.spool.peek_async(self.batch_size).await?;
        let batch = IngestBatch::from_queued(&rows);
        if batch.is_empty() {
            debug!("Spool empty, nothing to upload");
            return Ok(UploadOutcome::NoOp);
        }

        let sequence_ids: Vec<i64> = rows.iter().map(|r| r.sequence_id).collect();

        debug!(
            batch_size = batch.len(),
            first_sequence_id = sequence_ids[0],
            "Sending sample batch"
        );

        match self.transport.send(&batch).await {
            Ok(()) => {
                self.backoff().reset();
                let removed = self.spool.ack_async(sequence_ids.clone()).await?;
                info!(
                    delivered = sequence_ids.len(),
                    acked = removed,
                    first_sequence_id = sequence_ids[0],
                    last_sequence_id = sequence_ids[sequence_ids.len() - 1],
                    "Uploaded sample batch"
                );
                Ok(UploadOutcome::Success {
                    delivered: sequence_ids.len(),
                })
            }
            Err(e) => {
                let (failures, next_backoff) = {
                    let mut backoff = self.backoff();
                    let failures = backoff.record_failure();
                    (failures, backoff.current_delay())
                };
                warn!(
                    error = %e,
                    batch_size = sequence_ids.len(),
                    consecutive_failures = failures,
                    next_backoff_secs = next_backoff.as_secs_f64(),
                    "Upload failed, batch kept in spool"
                );
                Ok(UploadOutcome::Failure(e))
            }
        }
    }

    /// Current backoff delay. Reading it has no side effects.
    pub fn current_backoff(&self) -> Duration {
        self.backoff().current_delay()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff().consecutive_failures()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Get the spool this uploader drains.
    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    fn backoff(&self) -> MutexGuard<'_, BackoffState> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process transports for tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use reqwest::StatusCode;

    use super::{IngestTransport, TransportError};
    use crate::sample::{IngestBatch, Sample};

    /// What the fake server should answer.
    #[derive(Debug, Clone, Copy)]
    pub enum Reply {
        Accept,
        Status(u16),
        Timeout,
    }

    /// Records every delivered batch and answers from a script, falling
    /// back to a default reply once the script is exhausted.
    #[derive(Clone)]
    pub struct FakeTransport {
        script: Arc<Mutex<VecDeque<Reply>>>,
        default: Reply,
        pub calls: Arc<AtomicUsize>,
        pub received: Arc<Mutex<Vec<Vec<Sample>>>>,
    }

    impl FakeTransport {
        pub fn always(reply: Reply) -> Self {
            Self::scripted(Vec::new(), reply)
        }

        pub fn scripted(replies: Vec<Reply>, default: Reply) -> Self {
            Self {
                script: Arc::new(Mutex::new(replies.into())),
                default,
                calls: Arc::new(AtomicUsize::new(0)),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn received(&self) -> Vec<Vec<Sample>> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IngestTransport for FakeTransport {
        async fn send(&self, batch: &IngestBatch<'_>) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.script.lock().unwrap().pop_front().unwrap_or(self.default);
            match reply {
                Reply::Accept => {
                    let samples = batch.samples.iter().map(|s| (*s).clone()).collect();
                    self.received.lock().unwrap().push(samples);
                    Ok(())
                }
                Reply::Status(code) => Err(TransportError::Status {
                    code: StatusCode::from_u16(code).unwrap(),
                    message: "rejected".to_string(),
                }),
                Reply::Timeout => Err(TransportError::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{FakeTransport, Reply};
    use super::*;
    use crate::sample::{QueuedSample, Sample};

    const INGEST_URL: &str = "https://vps.example.com";

    fn settings(batch_size: usize) -> UploaderSettings {
        UploaderSettings {
            batch_size,
            ..UploaderSettings::new(INGEST_URL, "test-device-token")
        }
    }

    fn temp_spool() -> (tempfile::TempDir, Arc<Spool>) {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::open(tmp.path().join("spool.db")).unwrap();
        (tmp, Arc::new(spool))
    }

    fn sample(power_w: i64, second: u32) -> Sample {
        Sample::new("hw-p1-001", format!("2026-02-13T10:00:{second:02}+00:00"), power_w)
            .with_energy(123.456, 78.9)
    }

    fn uploader(spool: &Arc<Spool>, transport: &FakeTransport, batch_size: usize) -> Uploader {
        Uploader::with_transport(
            Arc::clone(spool),
            &settings(batch_size),
            Box::new(transport.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_appends_ingest_path() {
        let endpoint = IngestEndpoint::parse("https://vps.example.com/").unwrap();
        assert_eq!(endpoint.url().as_str(), "https://vps.example.com/v1/ingest");

        let endpoint = IngestEndpoint::parse("https://vps.example.com/api").unwrap();
        assert_eq!(endpoint.url().as_str(), "https://vps.example.com/api/v1/ingest");
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let err = IngestEndpoint::parse("http://vps.example.com").unwrap_err();
        assert!(matches!(err, ConfigurationError::InsecureScheme { ref scheme } if scheme == "http"));
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!(matches!(
            IngestEndpoint::parse("not a url"),
            Err(ConfigurationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_new_rejects_insecure_scheme_before_building_client() {
        let (_tmp, spool) = temp_spool();
        let insecure = UploaderSettings::new("http://vps.example.com", "token");
        let err = Uploader::new(Arc::clone(&spool), &insecure).err().unwrap();
        assert!(matches!(err, ConfigurationError::InsecureScheme { .. }));

        let transport = FakeTransport::always(Reply::Accept);
        let err = Uploader::with_transport(spool, &insecure, Box::new(transport.clone()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::InsecureScheme { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn test_new_rejects_zero_batch_size() {
        let (_tmp, spool) = temp_spool();
        let err = Uploader::new(spool, &settings(0)).err().unwrap();
        assert!(matches!(err, ConfigurationError::ZeroBatchSize));
    }

    #[test]
    fn test_new_builds_https_client() {
        let (_tmp, spool) = temp_spool();
        let uploader = Uploader::new(spool, &settings(30)).unwrap();
        assert_eq!(uploader.batch_size(), 30);
        assert_eq!(uploader.current_backoff(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_spool_is_noop() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 30);

        let outcome = uploader.upload_batch().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::NoOp));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(uploader.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_noop_leaves_backoff_untouched() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Status(503));
        let uploader = uploader(&spool, &transport, 30);

        spool.enqueue(&sample(1, 0)).unwrap();
        uploader.upload_batch().await.unwrap();
        assert_eq!(uploader.consecutive_failures(), 1);

        let ids: Vec<i64> = spool.peek(10).unwrap().iter().map(|r| r.sequence_id).collect();
        spool.ack(&ids).unwrap();

        let outcome = uploader.upload_batch().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::NoOp));
        assert_eq!(uploader.consecutive_failures(), 1);
        assert_eq!(uploader.current_backoff(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_success_acks_sent_rows() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 30);

        for i in 0..3 {
            spool.enqueue(&sample(1500 + i, i as u32)).unwrap();
        }

        let outcome = uploader.upload_batch().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Success { delivered: 3 }));
        assert_eq!(spool.count().unwrap(), 0);

        let received = transport.received();
        assert_eq!(received.len(), 1);
        let powers: Vec<i64> = received[0].iter().map(|s| s.power_w).collect();
        assert_eq!(powers, vec![1500, 1501, 1502]);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_request() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 2);

        for i in 0..5 {
            spool.enqueue(&sample(i, i as u32)).unwrap();
        }

        uploader.upload_batch().await.unwrap();
        assert_eq!(spool.count().unwrap(), 3);
        let remaining: Vec<i64> = spool.peek(10).unwrap().iter().map(|r| r.sample.power_w).collect();
        assert_eq!(remaining, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_only_peeked_rows_are_acked() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 2);

        spool.enqueue(&sample(1, 0)).unwrap();
        spool.enqueue(&sample(2, 1)).unwrap();
        spool.enqueue(&sample(3, 2)).unwrap();

        uploader.upload_batch().await.unwrap();
        let left: Vec<i64> = spool.peek(10).unwrap().iter().map(|r| r.sample.power_w).collect();
        assert_eq!(left, vec![3]);
    }

    #[tokio::test]
    async fn test_failure_keeps_batch_and_grows_backoff() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Status(500));
        let uploader = uploader(&spool, &transport, 30);

        spool.enqueue(&sample(1, 0)).unwrap();
        spool.enqueue(&sample(2, 1)).unwrap();
        let before = spool.peek(10).unwrap();

        let outcome = uploader.upload_batch().await.unwrap();
        assert!(matches!(
            outcome,
            UploadOutcome::Failure(TransportError::Status { code, .. }) if code == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(spool.peek(10).unwrap(), before);
        assert_eq!(uploader.consecutive_failures(), 1);
        assert_eq!(uploader.current_backoff(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_client_error_is_also_failure() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Status(401));
        let uploader = uploader(&spool, &transport, 30);
        spool.enqueue(&sample(1, 0)).unwrap();

        assert!(uploader.upload_batch().await.unwrap().is_failure());
        assert_eq!(spool.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failures_never_lose_samples() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::scripted(vec![Reply::Timeout, Reply::Status(502)], Reply::Status(503));
        let uploader = uploader(&spool, &transport, 4);

        let mut enqueued = 0u64;
        for round in 0..10 {
            for i in 0..3 {
                spool.enqueue(&sample(round * 10 + i, i as u32)).unwrap();
                enqueued += 1;
            }
            assert!(uploader.upload_batch().await.unwrap().is_failure());
        }

        assert_eq!(spool.count().unwrap(), enqueued);
        assert_eq!(uploader.consecutive_failures(), 10);
        assert_eq!(uploader.current_backoff(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_backoff_resets_after_success() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::scripted(
            vec![Reply::Timeout, Reply::Timeout, Reply::Timeout],
            Reply::Accept,
        );
        let uploader = uploader(&spool, &transport, 30);
        spool.enqueue(&sample(1, 0)).unwrap();

        for expected in [2, 4, 8] {
            assert!(uploader.upload_batch().await.unwrap().is_failure());
            assert_eq!(uploader.current_backoff(), Duration::from_secs(expected));
        }

        assert!(uploader.upload_batch().await.unwrap().is_success());
        assert_eq!(uploader.consecutive_failures(), 0);
        assert_eq!(uploader.current_backoff(), Duration::from_secs(1));
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_retry_resends_same_batch() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::scripted(vec![Reply::Status(503)], Reply::Accept);
        let uploader = uploader(&spool, &transport, 30);
        spool.enqueue(&sample(10, 0)).unwrap();
        spool.enqueue(&sample(20, 1)).unwrap();

        assert!(uploader.upload_batch().await.unwrap().is_failure());
        assert!(uploader.upload_batch().await.unwrap().is_success());

        let received = transport.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], vec![sample(10, 0), sample(20, 1)]);
    }

    #[tokio::test]
    async fn test_export_and_import_samples_end_to_end() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 30);

        let export = sample(-200, 0);
        let import = sample(1500, 1);
        assert_eq!(export.import_power_w, 0);
        spool.enqueue(&export).unwrap();
        spool.enqueue(&import).unwrap();

        let outcome = uploader.upload_batch().await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Success { delivered: 2 }));
        assert!(spool.peek(10).unwrap().is_empty());
        assert_eq!(transport.received(), vec![vec![export, import]]);
    }

    #[tokio::test]
    async fn test_closed_spool_is_storage_error() {
        let (_tmp, spool) = temp_spool();
        let transport = FakeTransport::always(Reply::Accept);
        let uploader = uploader(&spool, &transport, 30);
        spool.close().unwrap();

        assert!(matches!(uploader.upload_batch().await, Err(StorageError::Closed)));
        assert_eq!(uploader.consecutive_failures(), 0);
    }

    #[test]
    fn test_http_request_matches_ingest_contract() {
        let endpoint = IngestEndpoint::parse(INGEST_URL).unwrap();
        let transport =
            HttpTransport::new(endpoint, "test-device-token", DEFAULT_REQUEST_TIMEOUT).unwrap();

        let rows = vec![QueuedSample {
            sequence_id: 1,
            sample: sample(-200, 0),
            enqueued_at: "2026-02-13T10:00:01Z".to_string(),
        }];
        let request = transport.request(&IngestBatch::from_queued(&rows)).unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://vps.example.com/v1/ingest");
        let headers = request.headers();
        assert_eq!(
            headers[reqwest::header::AUTHORIZATION].to_str().unwrap(),
            "Bearer test-device-token"
        );
        assert_eq!(
            headers[reqwest::header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );

        let body = request.body().and_then(|b| b.as_bytes()).expect("JSON body");
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        let samples = json["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0]["device_id"], "hw-p1-001");
        assert_eq!(samples[0]["power_w"], -200);
        assert_eq!(samples[0]["import_power_w"], 0);
        assert!(samples[0].get("sequence_id").is_none());
    }

    #[tokio::test]
    async fn test_http_transport_silent_server_is_timeout() {
        // Accepts connections but never answers the TLS handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let endpoint = IngestEndpoint::parse(&format!("https://127.0.0.1:{port}")).unwrap();
        let transport =
            HttpTransport::new(endpoint, "test-device-token", Duration::from_millis(200)).unwrap();

        let rows = vec![QueuedSample {
            sequence_id: 1,
            sample: sample(1, 0),
            enqueued_at: "2026-02-13T10:00:01Z".to_string(),
        }];
        let result = transport.send(&IngestBatch::from_queued(&rows)).await;
        assert!(matches!(result, Err(TransportError::Timeout)), "got {result:?}");

        server.abort();
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "request timed out");

        let err = TransportError::Status {
            code: StatusCode::BAD_GATEWAY,
            message: "upstream down".to_string(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = UploaderSettings::new(INGEST_URL, "t");
        assert_eq!(settings.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(settings.max_backoff, Duration::from_secs(300));
        assert_eq!(settings.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
