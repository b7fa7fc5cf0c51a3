//! Request descriptors and key derivation.
//!
//! A [`Request`] is an immutable description of one logical request. Three keys
//! are derived from it, each answering a different question:
//!
//! - **cache key**: which response slot does this request read and write?
//! - **queue key**: which FIFO lane is it scheduled on?
//! - **abort key**: which cancellation group does it belong to?
//!
//! By default the queue key equals the cache key and the abort key ignores the
//! query string, so two cancelable searches against the same endpoint supersede
//! each other even though they cache separately.
//!
//! # Example
//!
//! ```
//! use courier_core::request::{Method, Request};
//!
//! let request = Request::new("/users")
//!     .with_method(Method::Get)
//!     .with_query("page=2")
//!     .with_cancelable(true);
//!
//! assert_eq!(request.cache_key(), "GET_/users?page=2");
//! assert_eq!(request.queue_key(), "GET_/users?page=2");
//! assert_eq!(request.abort_key(), "GET_/users");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for [`Method`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown request method: {0}")]
pub struct ParseMethodError(String);

/// HTTP-style request method.
///
/// The engine only uses the method to derive keys and to route between the
/// fetch lane (reads) and the submit lane (writes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Read request, routed to the fetch dispatcher
    #[default]
    Get,
    /// Create request
    Post,
    /// Replace request
    Put,
    /// Partial update request
    Patch,
    /// Delete request
    Delete,
}

impl Method {
    /// Upper-case wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether this method only reads data.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(ParseMethodError(s.to_string())),
        }
    }
}

/// Unique identifier of one queued request.
///
/// Generated by the dispatcher when a request is enqueued. Retries of the same
/// element keep their id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Immutable description of one logical request.
///
/// Built with the `with_*` methods and handed to a dispatcher. Once dispatched
/// it is never mutated; the attempt counter lives on the queue element.
///
/// Explicit keys override the derived defaults. Overriding the queue key lets
/// several cache entries share one lane; overriding the abort key groups
/// requests for cancellation across lanes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    endpoint: String,
    method: Method,
    query: Option<String>,
    body: Option<String>,
    cache_key: Option<String>,
    queue_key: Option<String>,
    abort_key: Option<String>,
    cancelable: bool,
    deduplicate: bool,
    retry: u32,
}

impl Request {
    /// Create a GET request for `endpoint` with default keys and no retries.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Get,
            query: None,
            body: None,
            cache_key: None,
            queue_key: None,
            abort_key: None,
            cancelable: false,
            deduplicate: false,
            retry: 0,
        }
    }

    /// Set the method.
    #[must_use]
    pub const fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the serialized query string (without the leading `?`).
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = if query.is_empty() { None } else { Some(query) };
        self
    }

    /// Set the serialized body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Override the derived cache key.
    #[must_use]
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Override the derived queue key.
    #[must_use]
    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.queue_key = Some(key.into());
        self
    }

    /// Override the derived abort key.
    #[must_use]
    pub fn with_abort_key(mut self, key: impl Into<String>) -> Self {
        self.abort_key = Some(key.into());
        self
    }

    /// Whether adding this request cancels live requests sharing its abort key.
    #[must_use]
    pub const fn with_cancelable(mut self, cancelable: bool) -> Self {
        self.cancelable = cancelable;
        self
    }

    /// Whether this request piggybacks on a live request with the same cache key.
    #[must_use]
    pub const fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// Number of retries allowed after the first failed attempt.
    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Endpoint path.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Request method.
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Serialized query string, if any.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Serialized body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Whether this request cancels earlier live requests with the same abort key.
    #[must_use]
    pub const fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    /// Whether this request coalesces onto live requests with the same cache key.
    #[must_use]
    pub const fn is_deduplicated(&self) -> bool {
        self.deduplicate
    }

    /// Retry budget (retries after the first attempt).
    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    /// Key identifying the response slot: `METHOD_endpoint?query` unless overridden.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.cache_key.clone().unwrap_or_else(|| {
            let base = self.base_key();
            match &self.query {
                Some(query) => format!("{base}?{query}"),
                None => base,
            }
        })
    }

    /// Key identifying the FIFO lane; defaults to the cache key.
    #[must_use]
    pub fn queue_key(&self) -> String {
        self.queue_key.clone().unwrap_or_else(|| self.cache_key())
    }

    /// Key identifying the cancellation group: `METHOD_endpoint` unless overridden.
    #[must_use]
    pub fn abort_key(&self) -> String {
        self.abort_key.clone().unwrap_or_else(|| self.base_key())
    }

    fn base_key(&self) -> String {
        format!("{}_{}", self.method, self.endpoint)
    }
}
