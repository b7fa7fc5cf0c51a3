//! # Courier Testing
//!
//! Test doubles for the Courier request engine.
//!
//! This crate provides:
//! - Clocks: [`ManualClock`] (moved by hand) and [`TokioClock`] (follows Tokio
//!   time, so paused-time tests drive it)
//! - [`MockTransport`]: scripted responses, delays and progress signals
//! - [`ToggleConnectivity`]: online state flipped by the test
//! - [`EventRecorder`]: captures lifecycle events for assertions
//! - Property-test strategies for requests
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{EventRecorder, MockTransport, TokioClock};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_search() {
//!     let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(100)));
//!     let client = Client::builder(transport.clone())
//!         .with_clock(Arc::new(TokioClock::new()))
//!         .build();
//!     let recorder = EventRecorder::attach(client.events(), "GET_/search?q=a", "GET_/search");
//!
//!     client.send(Request::new("/search").with_query("q=a"), AddOptions::default());
//!     tokio::time::sleep(Duration::from_millis(200)).await;
//!
//!     assert_eq!(recorder.loading_states(), vec![true, false]);
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

mod recorder;

pub use recorder::EventRecorder;

/// 2025-01-01 00:00:00 UTC, the start of every test clock.
#[must_use]
pub fn test_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Mock implementations of environment traits and the transport.
pub mod mocks {
    use super::{Clock, DateTime, Utc, test_time};
    use courier_core::{Connectivity, Request, Transport, TransportContext, TransportResponse};
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clock moved explicitly by the test.
    ///
    /// Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::ManualClock;
    /// use courier_core::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(5));
    /// assert_eq!((clock.now() - before).num_seconds(), 5);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Clock starting at `start`.
        #[must_use]
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(start)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
            let mut now = lock(&self.now);
            *now += delta;
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            *lock(&self.now) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_time())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *lock(&self.now)
        }
    }

    /// Create a default manual clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> ManualClock {
        ManualClock::default()
    }

    /// Clock following Tokio's time source.
    ///
    /// Under `#[tokio::test(start_paused = true)]` it advances exactly as far as
    /// the test sleeps, which keeps coalescing windows and timestamps
    /// deterministic.
    #[derive(Debug, Clone, Copy)]
    pub struct TokioClock {
        base: DateTime<Utc>,
        started: tokio::time::Instant,
    }

    impl TokioClock {
        /// Clock reading [`test_time`] now.
        #[must_use]
        pub fn new() -> Self {
            Self {
                base: test_time(),
                started: tokio::time::Instant::now(),
            }
        }
    }

    impl Default for TokioClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.base + elapsed
        }
    }

    /// Connectivity probe switched by the test.
    #[derive(Debug, Clone)]
    pub struct ToggleConnectivity {
        online: Arc<AtomicBool>,
    }

    impl ToggleConnectivity {
        /// Probe starting in the given state.
        #[must_use]
        pub fn new(online: bool) -> Self {
            Self {
                online: Arc::new(AtomicBool::new(online)),
            }
        }

        /// Change the reported state.
        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }
    }

    impl Default for ToggleConnectivity {
        fn default() -> Self {
            Self::new(true)
        }
    }

    impl Connectivity for ToggleConnectivity {
        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }
    }

    struct Scripted {
        response: TransportResponse,
        delay: Option<Duration>,
    }

    /// Transport returning scripted responses.
    ///
    /// Responses are queued per endpoint and consumed in order. An endpoint with
    /// nothing queued answers `200` with `{"endpoint": .., "query": ..}`.
    /// Every call waits for the configured delay (Tokio time) before answering.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::MockTransport;
    /// use courier_core::TransportResponse;
    /// use serde_json::json;
    /// use std::time::Duration;
    ///
    /// let transport = MockTransport::new().with_delay(Duration::from_millis(100));
    /// transport.respond("/users", TransportResponse::failure(json!("down"), 503));
    /// transport.respond("/users", TransportResponse::success(json!([]), 200));
    /// ```
    #[derive(Default)]
    pub struct MockTransport {
        delay: Duration,
        progress_total: Option<u64>,
        scripted: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<Request>>,
        completed: AtomicUsize,
    }

    impl MockTransport {
        /// Transport answering immediately.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Delay applied to every call without its own delay.
        #[must_use]
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Report upload progress before waiting and response start plus
        /// download progress after, for a body of `total` bytes.
        #[must_use]
        pub fn with_progress(mut self, total: u64) -> Self {
            self.progress_total = Some(total);
            self
        }

        /// Queue a response for the next call to `endpoint`.
        pub fn respond(&self, endpoint: &str, response: TransportResponse) {
            self.push(endpoint, Scripted {
                response,
                delay: None,
            });
        }

        /// Queue a response delivered after `delay` instead of the default delay.
        pub fn respond_after(&self, endpoint: &str, response: TransportResponse, delay: Duration) {
            self.push(endpoint, Scripted {
                response,
                delay: Some(delay),
            });
        }

        fn push(&self, endpoint: &str, scripted: Scripted) {
            lock(&self.scripted)
                .entry(endpoint.to_string())
                .or_default()
                .push_back(scripted);
        }

        /// Every request the transport was called with, in call order.
        #[must_use]
        pub fn calls(&self) -> Vec<Request> {
            lock(&self.calls).clone()
        }

        /// Number of calls started.
        #[must_use]
        pub fn call_count(&self) -> usize {
            lock(&self.calls).len()
        }

        /// Number of calls that ran to completion (not dropped by cancellation).
        #[must_use]
        pub fn completed_count(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn perform<'a>(
            &'a self,
            request: &'a Request,
            context: TransportContext,
        ) -> BoxFuture<'a, TransportResponse> {
            Box::pin(async move {
                lock(&self.calls).push(request.clone());
                let scripted = lock(&self.scripted)
                    .get_mut(request.endpoint())
                    .and_then(VecDeque::pop_front);
                let (response, delay) = match scripted {
                    Some(Scripted { response, delay }) => (response, delay.unwrap_or(self.delay)),
                    None => (
                        TransportResponse::success(
                            json!({ "endpoint": request.endpoint(), "query": request.query() }),
                            200,
                        ),
                        self.delay,
                    ),
                };

                if let Some(total) = self.progress_total {
                    context.progress.upload(total / 2, total);
                    context.progress.upload(total, total);
                }
                tokio::time::sleep(delay).await;
                if let Some(total) = self.progress_total {
                    context.progress.response_start();
                    context.progress.download(total / 2, total);
                    context.progress.download(total, total);
                }

                self.completed.fetch_add(1, Ordering::SeqCst);
                response
            })
        }
    }
}

/// Property-based testing strategies.
pub mod properties {
    use courier_core::{Method, Request};
    use proptest::prelude::*;

    /// Any HTTP method.
    pub fn arb_method() -> impl Strategy<Value = Method> {
        prop_oneof![
            Just(Method::Get),
            Just(Method::Post),
            Just(Method::Put),
            Just(Method::Patch),
            Just(Method::Delete),
        ]
    }

    /// Requests over a small endpoint space, so key collisions happen.
    pub fn arb_request() -> impl Strategy<Value = Request> {
        (
            arb_method(),
            prop::sample::select(vec!["/users", "/search", "/items"]),
            proptest::option::of("[a-z]{1,3}=[0-9]{1,2}"),
            any::<bool>(),
        )
            .prop_map(|(method, endpoint, query, cancelable)| {
                let request = Request::new(endpoint)
                    .with_method(method)
                    .with_cancelable(cancelable);
                match query {
                    Some(query) => request.with_query(query),
                    None => request,
                }
            })
    }
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Honors `RUST_LOG`; calling it more than once is harmless.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{ManualClock, MockTransport, TokioClock, ToggleConnectivity, test_clock};

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use courier_core::{Connectivity, Request, Transport, TransportContext, TransportResponse};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_manual_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), test_time());

        let shared = clock.clone();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((shared.now() - test_time()).num_milliseconds(), 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!((clock.now() - test_time()).num_milliseconds(), 250);
    }

    #[test]
    fn test_toggle_connectivity() {
        let connectivity = ToggleConnectivity::default();
        assert!(connectivity.is_online());
        connectivity.set_online(false);
        assert!(!connectivity.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_transport_script_then_default() {
        let transport = MockTransport::new();
        transport.respond("/a", TransportResponse::failure(json!("nope"), 500));
        let request = Request::new("/a").with_query("x=1");

        let first = transport.perform(&request, TransportContext::detached()).await;
        let second = transport.perform(&request, TransportContext::detached()).await;

        assert_eq!(first, TransportResponse::failure(json!("nope"), 500));
        assert_eq!(
            second.data,
            Some(json!({ "endpoint": "/a", "query": "x=1" }))
        );
        assert_eq!(transport.call_count(), 2);
        assert_eq!(transport.completed_count(), 2);
    }
}
