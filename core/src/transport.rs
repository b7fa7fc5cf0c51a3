//! The pluggable transport contract.
//!
//! The engine never performs I/O itself. A [`Transport`] receives a request
//! together with a [`TransportContext`] and resolves to a [`TransportResponse`].
//! The context carries the cancellation token owned by the dispatcher and a
//! [`ProgressSink`] through which the transport reports upload progress, the
//! start of the response, and download progress.
//!
//! # Example
//!
//! ```
//! use courier_core::request::Request;
//! use courier_core::transport::{FnTransport, TransportContext, TransportResponse};
//! use serde_json::json;
//!
//! let transport = FnTransport::new(|request: Request, _ctx: TransportContext| async move {
//!     TransportResponse::success(json!({ "endpoint": request.endpoint() }), 200)
//! });
//! # let _ = transport;
//! ```

use crate::request::Request;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Raw result of one transport call.
///
/// Exactly one of `data` / `error` is populated for a terminal outcome. A
/// response is considered failed when `error` is present, regardless of status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    /// Response payload on success
    pub data: Option<Value>,
    /// Error payload on failure
    pub error: Option<Value>,
    /// Status code reported by the transport (0 when none was received)
    pub status: u16,
}

impl TransportResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(data: Value, status: u16) -> Self {
        Self {
            data: Some(data),
            error: None,
            status,
        }
    }

    /// Failed response.
    #[must_use]
    pub const fn failure(error: Value, status: u16) -> Self {
        Self {
            data: None,
            error: Some(error),
            status,
        }
    }

    /// Whether the transport reported an error.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Snapshot of upload or download progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Percentage complete, 0.0 to 100.0
    pub progress: f64,
    /// Bytes transferred so far
    pub loaded: u64,
    /// Total bytes expected (0 when unknown)
    pub total: u64,
    /// Bytes still to transfer
    pub size_left: u64,
    /// Estimated time remaining, when it can be extrapolated
    pub time_left: Option<Duration>,
    /// When the transfer started
    pub started_at: DateTime<Utc>,
}

impl Progress {
    /// Compute progress from byte counts and the transfer start time.
    ///
    /// The remaining time is extrapolated linearly from the elapsed time.
    #[must_use]
    pub fn calculate(
        loaded: u64,
        total: u64,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let loaded = if total > 0 { loaded.min(total) } else { loaded };
        let size_left = total.saturating_sub(loaded);

        // Note: Precision loss acceptable for display percentages
        #[allow(clippy::cast_precision_loss)]
        let progress = if total == 0 {
            0.0
        } else {
            (loaded as f64 / total as f64) * 100.0
        };

        let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        let time_left = if loaded == 0 || total == 0 {
            None
        } else {
            #[allow(clippy::cast_precision_loss)]
            let secs = elapsed.as_secs_f64() * size_left as f64 / loaded as f64;
            // None when the estimate is too far out to represent
            Duration::try_from_secs_f64(secs).ok()
        };

        Self {
            progress,
            loaded,
            total,
            size_left,
            time_left,
            started_at,
        }
    }
}

/// Signal emitted by a transport while a call is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportSignal {
    /// Bytes of the request body sent so far
    UploadProgress {
        /// Bytes sent
        loaded: u64,
        /// Total bytes to send
        total: u64,
    },
    /// The response started arriving
    ResponseStart,
    /// Bytes of the response body received so far
    DownloadProgress {
        /// Bytes received
        loaded: u64,
        /// Total bytes expected
        total: u64,
    },
}

/// Receiver of [`TransportSignal`]s for one transport call.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(TransportSignal) + Send + Sync>);

impl ProgressSink {
    /// Wrap a signal handler.
    pub fn new(handler: impl Fn(TransportSignal) + Send + Sync + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// A sink that drops every signal.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Report upload progress.
    pub fn upload(&self, loaded: u64, total: u64) {
        (self.0)(TransportSignal::UploadProgress { loaded, total });
    }

    /// Report that the response started arriving.
    pub fn response_start(&self) {
        (self.0)(TransportSignal::ResponseStart);
    }

    /// Report download progress.
    pub fn download(&self, loaded: u64, total: u64) {
        (self.0)(TransportSignal::DownloadProgress { loaded, total });
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink(<fn>)")
    }
}

/// Per-call context handed to the transport.
#[derive(Clone, Debug)]
pub struct TransportContext {
    /// Cancelled by the dispatcher when the request is aborted
    pub cancellation: CancellationToken,
    /// Progress reporting channel
    pub progress: ProgressSink,
}

impl TransportContext {
    /// Build a context from its parts.
    #[must_use]
    pub const fn new(cancellation: CancellationToken, progress: ProgressSink) -> Self {
        Self {
            cancellation,
            progress,
        }
    }

    /// Context with a fresh token and a no-op progress sink.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), ProgressSink::noop())
    }
}

/// Pluggable network client.
///
/// Implementations perform the actual I/O. They should stop work promptly when
/// `context.cancellation` fires; the dispatcher drops the returned future on
/// cancellation either way. Timeouts belong here too: a timed-out call is
/// reported as a failed response.
///
/// # Dyn Compatibility
///
/// Returns a boxed future instead of using `async fn` so the dispatcher can hold
/// an `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Perform one call.
    fn perform<'a>(
        &'a self,
        request: &'a Request,
        context: TransportContext,
    ) -> BoxFuture<'a, TransportResponse>;
}

/// Adapter turning an async closure into a [`Transport`].
pub struct FnTransport<F> {
    f: F,
}

impl<F> FnTransport<F> {
    /// Wrap the closure.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Request, TransportContext) -> Fut + Send + Sync,
    Fut: Future<Output = TransportResponse> + Send + 'static,
{
    fn perform<'a>(
        &'a self,
        request: &'a Request,
        context: TransportContext,
    ) -> BoxFuture<'a, TransportResponse> {
        Box::pin((self.f)(request.clone(), context))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_progress_calculation() {
        let progress = Progress::calculate(25, 100, at(0), at(5));
        assert!((progress.progress - 25.0).abs() < f64::EPSILON);
        assert_eq!(progress.size_left, 75);
        assert_eq!(progress.time_left, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_progress_unknown_total() {
        let progress = Progress::calculate(10, 0, at(0), at(1));
        assert!(progress.progress.abs() < f64::EPSILON);
        assert_eq!(progress.size_left, 0);
        assert_eq!(progress.time_left, None);
    }

    #[test]
    fn test_progress_estimate_out_of_range() {
        let progress = Progress::calculate(1, u64::MAX, at(0), at(10));
        assert_eq!(progress.loaded, 1);
        assert_eq!(progress.time_left, None);
    }

    #[test]
    fn test_progress_clamps_overshoot() {
        let progress = Progress::calculate(150, 100, at(0), at(1));
        assert_eq!(progress.loaded, 100);
        assert!((progress.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sink_forwards_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sink = ProgressSink::new(move |signal| {
            seen_clone.lock().unwrap().push(signal);
        });

        sink.upload(1, 2);
        sink.response_start();
        sink.download(3, 4);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                TransportSignal::UploadProgress { loaded: 1, total: 2 },
                TransportSignal::ResponseStart,
                TransportSignal::DownloadProgress { loaded: 3, total: 4 },
            ]
        );
    }

    #[test]
    fn test_fn_transport() {
        let transport = FnTransport::new(|request: Request, _ctx| async move {
            TransportResponse::success(json!(request.endpoint()), 200)
        });
        let request = Request::new("/ping");

        let response =
            tokio_test::block_on(transport.perform(&request, TransportContext::detached()));

        assert_eq!(response, TransportResponse::success(json!("/ping"), 200));
        assert!(!response.is_failed());
    }
}
