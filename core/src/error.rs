//! Request failure taxonomy.
//!
//! Every terminal outcome of a request that is not a success is one of the
//! variants of [`RequestError`]. Only transport and offline failures are ever
//! retried; cancellation and validation failures are final on first sight.

use serde_json::Value;
use thiserror::Error;

/// Why a request did not produce a successful response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// The transport returned an error payload.
    #[error("Request failed with status {status}")]
    Transport {
        /// Status code reported by the transport
        status: u16,
        /// Error payload returned by the transport
        payload: Value,
    },

    /// The transport failed while the environment reported no connectivity.
    #[error("Request failed while offline (status {status})")]
    Offline {
        /// Status code reported by the transport
        status: u16,
        /// Error payload returned by the transport
        payload: Value,
    },

    /// The request was aborted before it completed.
    #[error("Request was canceled")]
    Canceled,

    /// A request or response interceptor rejected the request.
    #[error("Request validation failed: {0}")]
    Validation(String),
}

impl RequestError {
    /// Whether the dispatcher may retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Offline { .. })
    }

    /// Whether this error is a cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Whether this error was caused by lost connectivity.
    #[must_use]
    pub const fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. })
    }

    /// Status code, if the transport produced one.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } | Self::Offline { status, .. } => Some(*status),
            Self::Canceled | Self::Validation(_) => None,
        }
    }

    /// Error payload as it would be stored in the cache.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Transport { payload, .. } | Self::Offline { payload, .. } => payload.clone(),
            Self::Canceled => Value::String(self.to_string()),
            Self::Validation(reason) => Value::String(reason.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_transport_failures_retry() {
        let transport = RequestError::Transport {
            status: 500,
            payload: json!({"message": "boom"}),
        };
        let offline = RequestError::Offline { status: 0, payload: Value::Null };

        assert!(transport.is_retryable());
        assert!(offline.is_retryable());
        assert!(!RequestError::Canceled.is_retryable());
        assert!(!RequestError::Validation("missing token".into()).is_retryable());
    }

    #[test]
    fn test_status_and_payload() {
        let err = RequestError::Transport { status: 404, payload: json!("not found") };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.payload(), json!("not found"));
        assert_eq!(RequestError::Canceled.status(), None);
        assert_eq!(
            RequestError::Validation("bad".into()).payload(),
            json!("bad")
        );
    }
}
