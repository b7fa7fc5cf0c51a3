//! Request and response transformation pipeline.
//!
//! Interceptors run inside the dispatcher around every transport call, in
//! registration order. A request interceptor may rewrite the request (add
//! headers to the body, sign the query, ...) or reject it; a response
//! interceptor may rewrite or reject the transport response. Any rejection ends
//! the request with [`RequestError::Validation`], which is never retried and
//! never cached.

use courier_core::{Request, RequestError, TransportResponse};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// One stage of the request pipeline.
///
/// Every method has a pass-through default, so implementors override only the
/// hooks they need.
pub trait Interceptor: Send + Sync {
    /// Transform the request before it reaches the transport.
    ///
    /// # Errors
    ///
    /// Returning an error rejects the request without calling the transport.
    fn on_request(&self, request: Request) -> anyhow::Result<Request> {
        Ok(request)
    }

    /// Transform the transport response.
    ///
    /// # Errors
    ///
    /// Returning an error turns the outcome into a validation failure.
    fn on_response(
        &self,
        response: TransportResponse,
        _request: &Request,
    ) -> anyhow::Result<TransportResponse> {
        Ok(response)
    }

    /// Map an error payload before it is published and cached.
    fn on_error(&self, payload: Value, _request: &Request) -> Value {
        payload
    }
}

struct RequestFn<F>(F);

impl<F> Interceptor for RequestFn<F>
where
    F: Fn(Request) -> anyhow::Result<Request> + Send + Sync,
{
    fn on_request(&self, request: Request) -> anyhow::Result<Request> {
        (self.0)(request)
    }
}

struct ResponseFn<F>(F);

impl<F> Interceptor for ResponseFn<F>
where
    F: Fn(TransportResponse, &Request) -> anyhow::Result<TransportResponse> + Send + Sync,
{
    fn on_response(
        &self,
        response: TransportResponse,
        request: &Request,
    ) -> anyhow::Result<TransportResponse> {
        (self.0)(response, request)
    }
}

/// Interceptor from a request-rewriting closure.
pub fn request_interceptor<F>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(Request) -> anyhow::Result<Request> + Send + Sync + 'static,
{
    Arc::new(RequestFn(f))
}

/// Interceptor from a response-rewriting closure.
pub fn response_interceptor<F>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(TransportResponse, &Request) -> anyhow::Result<TransportResponse> + Send + Sync + 'static,
{
    Arc::new(ResponseFn(f))
}

/// Ordered interceptors applied by a dispatcher.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    /// Empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor.
    #[must_use]
    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Append an interceptor in place.
    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Number of interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run every request hook in order.
    ///
    /// # Errors
    ///
    /// [`RequestError::Validation`] from the first interceptor that rejects.
    pub fn apply_request(&self, request: Request) -> Result<Request, RequestError> {
        self.interceptors
            .iter()
            .try_fold(request, |request, interceptor| {
                interceptor
                    .on_request(request)
                    .map_err(|err| RequestError::Validation(err.to_string()))
            })
    }

    /// Run every response hook in order, then map the error payload if any.
    ///
    /// # Errors
    ///
    /// [`RequestError::Validation`] from the first interceptor that rejects.
    pub fn apply_response(
        &self,
        response: TransportResponse,
        request: &Request,
    ) -> Result<TransportResponse, RequestError> {
        let mut response = self
            .interceptors
            .iter()
            .try_fold(response, |response, interceptor| {
                interceptor
                    .on_response(response, request)
                    .map_err(|err| RequestError::Validation(err.to_string()))
            })?;

        if let Some(payload) = response.error.take() {
            let mapped = self
                .interceptors
                .iter()
                .fold(payload, |payload, interceptor| interceptor.on_error(payload, request));
            response.error = Some(mapped);
        }
        Ok(response)
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use serde_json::json;

    struct Redact;

    impl Interceptor for Redact {
        fn on_error(&self, _payload: Value, request: &Request) -> Value {
            json!({ "endpoint": request.endpoint(), "message": "redacted" })
        }
    }

    #[test]
    fn test_request_hooks_run_in_order() {
        let chain = InterceptorChain::new()
            .with(request_interceptor(|r: Request| Ok(r.with_query("a=1"))))
            .with(request_interceptor(|r: Request| {
                let query = r.query().unwrap_or_default().to_string();
                Ok(r.with_query(format!("{query}&b=2")))
            }));

        let request = chain.apply_request(Request::new("/x")).unwrap();
        assert_eq!(request.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_rejection_becomes_validation_error() {
        let chain = InterceptorChain::new()
            .with(request_interceptor(|_| Err(anyhow::anyhow!("missing token"))));

        let err = chain.apply_request(Request::new("/x")).unwrap_err();
        assert_eq!(err, RequestError::Validation("missing token".into()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_response_rejection() {
        let chain = InterceptorChain::new().with(response_interceptor(|response, _| {
            if response.data == Some(json!(null)) {
                anyhow::bail!("empty body");
            }
            Ok(response)
        }));

        let request = Request::new("/x");
        let ok = chain
            .apply_response(TransportResponse::success(json!(1), 200), &request)
            .unwrap();
        assert_eq!(ok.data, Some(json!(1)));

        let err = chain
            .apply_response(TransportResponse::success(json!(null), 200), &request)
            .unwrap_err();
        assert!(matches!(err, RequestError::Validation(_)));
    }

    #[test]
    fn test_error_payload_mapping_only_on_failure() {
        let chain = InterceptorChain::new().with(Arc::new(Redact));
        let request = Request::new("/secret");

        let failed = chain
            .apply_response(TransportResponse::failure(json!("stack trace"), 500), &request)
            .unwrap();
        assert_eq!(
            failed.error,
            Some(json!({ "endpoint": "/secret", "message": "redacted" }))
        );

        let ok = chain
            .apply_response(TransportResponse::success(json!(1), 200), &request)
            .unwrap();
        assert_eq!(ok.error, None);
    }
}
