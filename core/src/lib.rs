//! # Courier Core
//!
//! Core types for the Courier request orchestration engine.
//!
//! This crate defines the vocabulary shared by the runtime and by transports:
//! what a request is, how it is keyed, what a transport must do, and how a
//! request can fail. It contains no scheduling logic.
//!
//! ## Core Concepts
//!
//! - **Request**: Immutable descriptor with derived cache, queue and abort keys
//! - **Transport**: Pluggable async client performing the actual I/O
//! - **`RequestError`**: Transport, offline, canceled and validation failures
//! - **Environment**: Injected `Clock` and `Connectivity` for testability
//!
//! ## Example
//!
//! ```
//! use courier_core::request::{Method, Request};
//!
//! let search = Request::new("/search")
//!     .with_method(Method::Get)
//!     .with_query("q=rust")
//!     .with_cancelable(true)
//!     .with_retry(2);
//!
//! assert_eq!(search.cache_key(), "GET_/search?q=rust");
//! assert_eq!(search.abort_key(), "GET_/search");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;
pub use tokio_util::sync::CancellationToken;

/// Request failure taxonomy
pub mod error;

/// Request descriptors and key derivation
pub mod request;

/// Transport contract, responses and progress reporting
pub mod transport;

/// Environment module - Dependency injection traits
///
/// Time and connectivity are abstracted behind traits so the dispatcher and the
/// cache can be driven deterministically in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    ///
    /// // Test - manually advanced clock
    /// let clock = ManualClock::new(start);
    /// clock.advance(Duration::from_millis(100));
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Connectivity probe consulted when a transport call fails.
    ///
    /// A failure observed while offline is reported as
    /// [`RequestError::Offline`](crate::error::RequestError::Offline) instead of a
    /// plain transport error.
    pub trait Connectivity: Send + Sync {
        /// Whether the environment currently has network connectivity
        fn is_online(&self) -> bool;
    }

    /// Connectivity probe for environments without an online signal.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysOnline;

    impl Connectivity for AlwaysOnline {
        fn is_online(&self) -> bool {
            true
        }
    }
}

pub use environment::{AlwaysOnline, Clock, Connectivity, SystemClock};
pub use error::RequestError;
pub use request::{Method, Request, RequestId};
pub use transport::{
    FnTransport, Progress, ProgressSink, Transport, TransportContext, TransportResponse,
    TransportSignal,
};
