//! The client: one explicit context value owning the cache, the event bus and
//! the dispatchers.
//!
//! Reads (GET) go through the fetch dispatcher, everything else through the
//! submit dispatcher. Both share the cache and the bus, so a UI layer only ever
//! needs a handle to the client.

use crate::cache::Cache;
use crate::dispatcher::{AddOptions, Dispatcher};
use crate::error::ClientError;
use crate::events::EventBus;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::listeners::Subscription;
use crate::ClientConfig;
use courier_core::{
    AlwaysOnline, Clock, Connectivity, Request, RequestError, RequestId, SystemClock, Transport,
    TransportResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Terminal notifications relayed to [`Client::send_and_wait`].
enum Terminal {
    Response(Result<TransportResponse, RequestError>),
    Aborted,
    Removed,
}

/// Request engine entry point.
///
/// Cheap to clone; clones share every component.
///
/// # Example
///
/// ```no_run
/// use courier_core::{FnTransport, Request, TransportResponse};
/// use courier_runtime::Client;
/// use serde_json::json;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), courier_runtime::error::ClientError> {
/// let client = Client::new(Arc::new(FnTransport::new(|_req, _ctx| async {
///     TransportResponse::success(json!({ "ok": true }), 200)
/// })));
///
/// let response = client
///     .send_and_wait(Request::new("/health"), Duration::from_secs(5))
///     .await?;
/// assert_eq!(response.status, 200);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    cache: Cache,
    events: EventBus,
    fetch: Dispatcher,
    submit: Dispatcher,
}

impl Client {
    /// Client with default configuration, system clock and no connectivity probe.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Client with an explicit configuration.
    #[must_use]
    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self::builder(transport).with_config(config).build()
    }

    /// Start building a client.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder {
            transport,
            config: ClientConfig::default(),
            clock: Arc::new(SystemClock),
            connectivity: Arc::new(AlwaysOnline),
            interceptors: InterceptorChain::new(),
        }
    }

    /// The shared cache.
    #[must_use]
    pub const fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The shared lifecycle event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Dispatcher for reads.
    #[must_use]
    pub const fn fetch_dispatcher(&self) -> &Dispatcher {
        &self.fetch
    }

    /// Dispatcher for writes.
    #[must_use]
    pub const fn submit_dispatcher(&self) -> &Dispatcher {
        &self.submit
    }

    /// Dispatcher responsible for `request`.
    #[must_use]
    pub fn dispatcher_for(&self, request: &Request) -> &Dispatcher {
        if request.method().is_read() {
            &self.fetch
        } else {
            &self.submit
        }
    }

    /// Dispatch a request; the result arrives through the cache and the bus.
    pub fn send(&self, request: Request, options: AddOptions) -> RequestId {
        self.dispatcher_for(&request).add(request, options)
    }

    /// Dispatch a request and wait for its terminal outcome.
    ///
    /// Listeners follow the element that serves the call and are registered
    /// before any of its events can be published, so an outcome produced
    /// immediately is not missed. When the call is coalesced, the outcome of
    /// the element it joined is returned, whatever lane that element sits in.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Request`] for transport, offline, validation and
    ///   cancellation failures
    /// - [`ClientError::Removed`] when the element was deleted before it ran
    /// - [`ClientError::Timeout`] when nothing terminal happened within `timeout`
    pub async fn send_and_wait(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<TransportResponse, ClientError> {
        self.send_and_wait_with(request, AddOptions::default(), timeout)
            .await
    }

    /// [`send_and_wait`](Self::send_and_wait) with explicit add options.
    ///
    /// # Errors
    ///
    /// See [`send_and_wait`](Self::send_and_wait).
    pub async fn send_and_wait_with(
        &self,
        request: Request,
        options: AddOptions,
        timeout: Duration,
    ) -> Result<TransportResponse, ClientError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (request_id, subscription) = self
            .dispatcher_for(&request)
            .add_with(request, options, |request_id| {
                self.relay_terminal_events(request_id, &tx)
            });
        drop(tx);
        tracing::trace!(request_id = %request_id, "Waiting for terminal outcome");

        let result = tokio::time::timeout(timeout, async {
            match rx.recv().await {
                Some(Terminal::Response(outcome)) => outcome.map_err(ClientError::from),
                Some(Terminal::Aborted) => Err(ClientError::Request(RequestError::Canceled)),
                Some(Terminal::Removed) => Err(ClientError::Removed),
                None => Err(ClientError::ChannelClosed),
            }
        })
        .await;
        subscription.unsubscribe();

        result.map_err(|_| ClientError::Timeout)?
    }

    fn relay_terminal_events(
        &self,
        request_id: RequestId,
        tx: &mpsc::UnboundedSender<Terminal>,
    ) -> Subscription {
        let response_tx = tx.clone();
        let on_response = self.events.on_response_by_id(request_id, move |event| {
            let _ = response_tx.send(Terminal::Response(event.outcome.clone()));
        });
        let abort_tx = tx.clone();
        let on_abort = self.events.on_abort_by_id(request_id, move |_| {
            let _ = abort_tx.send(Terminal::Aborted);
        });
        let remove_tx = tx.clone();
        let on_remove = self.events.on_remove_by_id(request_id, move |_| {
            let _ = remove_tx.send(Terminal::Removed);
        });

        Subscription::merge(vec![on_response, on_abort, on_remove])
    }

    /// Cancel every live request sharing `abort_key` in both dispatchers.
    pub fn abort(&self, abort_key: &str) -> usize {
        self.fetch.abort(abort_key) + self.submit.abort(abort_key)
    }

    /// Cancel all requests and drop every cache entry.
    pub fn clear(&self) {
        self.fetch.clear();
        self.submit.clear();
        self.cache.clear();
        tracing::info!("Client cleared");
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    interceptors: InterceptorChain,
}

impl ClientBuilder {
    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock for cache timestamps and coalescing windows.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connectivity probe used to classify failures as offline.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Append an interceptor to both dispatchers.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the client.
    #[must_use]
    pub fn build(self) -> Client {
        let cache = Cache::new(Arc::clone(&self.clock));
        let events = EventBus::with_capacity(self.config.observer_capacity);

        let dispatcher = |name: &str, config| {
            Dispatcher::builder(Arc::clone(&self.transport), cache.clone(), events.clone())
                .name(name)
                .config(config)
                .clock(Arc::clone(&self.clock))
                .connectivity(Arc::clone(&self.connectivity))
                .interceptors(self.interceptors.clone())
                .build()
        };
        let fetch = dispatcher("fetch", self.config.fetch.clone());
        let submit = dispatcher("submit", self.config.submit.clone());

        tracing::debug!(
            fetch_concurrency = self.config.fetch.max_concurrency,
            submit_concurrency = self.config.submit.max_concurrency,
            "Client built"
        );

        Client {
            cache,
            events,
            fetch,
            submit,
        }
    }
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}
