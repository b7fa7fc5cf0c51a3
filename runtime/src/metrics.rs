//! Prometheus export of the request engine metrics.
//!
//! The dispatcher and the cache record through the `metrics` facade; nothing is
//! collected until a recorder is installed. [`MetricsServer`] installs the
//! Prometheus recorder and describes every metric:
//!
//! | Metric | Kind |
//! |---|---|
//! | `courier_requests_enqueued_total` | counter |
//! | `courier_requests_started_total` | counter |
//! | `courier_requests_coalesced_total` | counter |
//! | `courier_requests_canceled_total` | counter |
//! | `courier_requests_retried_total` | counter |
//! | `courier_requests_succeeded_total` | counter |
//! | `courier_requests_failed_total` | counter |
//! | `courier_cache_writes_total` | counter |
//! | `courier_requests_running` | gauge |
//! | `courier_request_duration_seconds` | histogram |
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` from your HTTP stack at `server.addr()`
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics installation.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the recorder
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders the scrape payload.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will be scraped at `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint is expected on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe the metrics and install the recorder.
    ///
    /// A recorder installed earlier in the process (another server, a test) is
    /// left in place; [`render`](Self::render) then returns `None`.
    ///
    /// # Errors
    ///
    /// [`MetricsError`] when the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("courier_request_duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                register_metrics();
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, keeping the existing one"
                    );
                    register_metrics();
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Current metrics in the Prometheus text format.
    ///
    /// `None` until this server installed the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Describe every metric the engine records.
pub fn register_metrics() {
    describe_counter!(
        "courier_requests_enqueued_total",
        "Requests appended to a dispatcher lane"
    );
    describe_counter!(
        "courier_requests_started_total",
        "Transport calls started, retries included"
    );
    describe_counter!(
        "courier_requests_coalesced_total",
        "Requests served by an already queued element"
    );
    describe_counter!(
        "courier_requests_canceled_total",
        "Elements aborted before completing"
    );
    describe_counter!(
        "courier_requests_retried_total",
        "Failed attempts moved back to their lane for another try"
    );
    describe_counter!(
        "courier_requests_succeeded_total",
        "Requests completed with a successful response"
    );
    describe_counter!(
        "courier_requests_failed_total",
        "Requests completed with an error"
    );
    describe_counter!("courier_cache_writes_total", "Cache entries written");
    describe_gauge!(
        "courier_requests_running",
        "Transport calls currently in flight"
    );
    describe_histogram!(
        "courier_request_duration_seconds",
        "Duration of one transport call"
    );
}

impl fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsServer")
            .field("addr", &self.addr)
            .field("installed", &self.handle.is_some())
            .finish()
    }
}
