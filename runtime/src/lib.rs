//! # Courier Runtime
//!
//! Request orchestration for the Courier engine: per-key FIFO lanes with
//! concurrency limits, coalescing, cancellation and retry, a keyed response
//! cache, and a lifecycle event bus.
//!
//! ## Components
//!
//! - [`dispatcher::Dispatcher`]: enqueues requests, drives the transport and
//!   decides retry versus terminal outcome
//! - [`cache::Cache`]: last known response per cache key, with per-key listeners
//! - [`events::EventBus`]: request start, progress, response, loading, abort and
//!   remove events, keyed by queue key or request id
//! - [`Client`]: one context value owning all of the above
//!
//! ## Example
//!
//! ```no_run
//! use courier_core::{FnTransport, Request, TransportResponse};
//! use courier_runtime::{AddOptions, Client};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let client = Client::new(Arc::new(FnTransport::new(|_req, _ctx| async {
//!     TransportResponse::success(json!([1, 2, 3]), 200)
//! })));
//!
//! let _loading = client.events().on_loading("GET_/items", |event| {
//!     println!("loading: {}", event.is_loading);
//! });
//! let _data = client.cache().events().on_data("GET_/items", |entry| {
//!     println!("items: {:?}", entry.data);
//! });
//!
//! client.send(Request::new("/items"), AddOptions::default());
//! # }
//! ```

mod listeners;

/// Keyed response cache
pub mod cache;

/// The client context value
pub mod client;

/// Queue lanes and request execution
pub mod dispatcher;

/// Lifecycle event bus
pub mod events;

/// Request and response interceptors
pub mod interceptor;

/// Prometheus metrics
pub mod metrics;

/// Retry backoff policy
pub mod retry;

pub use cache::{Cache, CacheEntry, CacheEvents};
pub use client::{Client, ClientBuilder};
pub use dispatcher::{AddOptions, Dispatcher, DispatcherConfig, ElementStatus, QueueElement};
pub use events::{EventBus, LifecycleEvent};
pub use listeners::Subscription;
pub use retry::RetryPolicy;

/// Error types
pub mod error {
    use courier_core::RequestError;
    use thiserror::Error;

    /// Errors returned by the awaiting helpers of [`Client`](crate::Client).
    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum ClientError {
        /// No terminal event arrived in time.
        #[error("Timed out waiting for a terminal response")]
        Timeout,

        /// The element was removed from its queue before it produced a response.
        #[error("Request was removed before completing")]
        Removed,

        /// The event relay closed unexpectedly.
        #[error("Event channel closed")]
        ChannelClosed,

        /// The request ended with an error.
        #[error(transparent)]
        Request(#[from] RequestError),
    }
}

/// Client configuration
///
/// # Example
///
/// ```
/// use courier_runtime::{ClientConfig, DispatcherConfig};
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_fetch(DispatcherConfig::new().with_max_concurrency(4))
///     .with_observer_capacity(256);
/// assert_eq!(config.fetch.max_concurrency, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Configuration of the read dispatcher
    pub fetch: DispatcherConfig,
    /// Configuration of the write dispatcher
    pub submit: DispatcherConfig,
    /// Buffer of the event bus observer channel
    pub observer_capacity: usize,
}

impl ClientConfig {
    /// Set the read dispatcher configuration.
    #[must_use]
    pub fn with_fetch(mut self, config: DispatcherConfig) -> Self {
        self.fetch = config;
        self
    }

    /// Set the write dispatcher configuration.
    #[must_use]
    pub fn with_submit(mut self, config: DispatcherConfig) -> Self {
        self.submit = config;
        self
    }

    /// Set the observer channel capacity.
    #[must_use]
    pub const fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fetch: DispatcherConfig::default(),
            submit: DispatcherConfig::default(),
            observer_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::RequestError;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.observer_capacity, 64);
        assert_eq!(config.fetch, DispatcherConfig::default());
    }

    #[test]
    fn test_client_error_from_request_error() {
        let err: error::ClientError = RequestError::Canceled.into();
        assert_eq!(err.to_string(), "Request was canceled");
    }
}
