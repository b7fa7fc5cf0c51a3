//! Lifecycle event bus.
//!
//! The dispatcher publishes every step of a request's life on the bus, and UI
//! adapters or debug tooling subscribe without knowing about the dispatcher.
//!
//! # Channels
//!
//! | Channel | Keyed by | Payload |
//! |---|---|---|
//! | request start | queue key / request id | [`RequestEventDetails`] |
//! | response start | queue key / request id | [`RequestEventDetails`] |
//! | upload progress | queue key / request id | [`ProgressEvent`] |
//! | download progress | queue key / request id | [`ProgressEvent`] |
//! | response | queue key / request id | [`ResponseEvent`] |
//! | loading | queue key / request id | [`LoadingEvent`] |
//! | abort | abort key / request id | [`RequestEventDetails`] |
//! | remove | queue key / request id | [`RequestEventDetails`] |
//!
//! Every subscription returns a [`Subscription`]. A listener receives each
//! event at most once, and never after it was unsubscribed, even when the
//! unsubscription happens inside another listener of the same event.
//!
//! # Example
//!
//! ```
//! use courier_runtime::events::EventBus;
//!
//! let bus = EventBus::new();
//! let subscription = bus.on_loading("GET_/users", |event| {
//!     println!("loading: {}", event.is_loading);
//! });
//! subscription.unsubscribe();
//! ```

use crate::listeners::{ListenerRegistry, Subscription};
use chrono::{DateTime, Utc};
use courier_core::{Progress, Request, RequestError, RequestId, TransportResponse};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle channel kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Transport call is about to start
    RequestStart,
    /// Response started arriving
    ResponseStart,
    /// Request body upload progress
    UploadProgress,
    /// Response body download progress
    DownloadProgress,
    /// Terminal success or failure
    Response,
    /// Loading state of a queue key changed
    Loading,
    /// Request was canceled
    Abort,
    /// Element left its queue
    Remove,
}

/// Address of a subscription: a channel scoped either by key or by request id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every request sharing the key (queue key, or abort key for [`Channel::Abort`])
    Key(Channel, String),
    /// One specific request
    Id(Channel, RequestId),
}

/// Common details attached to lifecycle events.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestEventDetails {
    /// Queue element id
    pub request_id: RequestId,
    /// The request being executed
    pub request: Arc<Request>,
    /// Retries performed so far
    pub retries: u32,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
    /// Whether the element was added as a revalidation
    pub is_revalidated: bool,
    /// Whether the element was added as a refresh
    pub is_refreshed: bool,
}

/// Upload or download progress of one request.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    /// Request details
    pub details: RequestEventDetails,
    /// Progress snapshot
    pub progress: Progress,
}

/// Terminal outcome of a request (success, transport error, offline error or
/// validation error). Cancellations go to the abort channel instead.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEvent {
    /// Request details
    pub details: RequestEventDetails,
    /// The response, or why there is none
    pub outcome: Result<TransportResponse, RequestError>,
}

impl ResponseEvent {
    /// Whether the request failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.outcome.is_err()
    }

    /// Whether the failure was observed while offline.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.outcome.as_ref().is_err_and(RequestError::is_offline)
    }
}

/// Loading state change for a queue key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadingEvent {
    /// Lane whose loading state changed
    pub queue_key: String,
    /// Element that caused the change
    pub request_id: RequestId,
    /// New loading state
    pub is_loading: bool,
    /// Whether the element is being retried
    pub is_retry: bool,
}

/// Every event the bus can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// See [`Channel::RequestStart`]
    RequestStart(RequestEventDetails),
    /// See [`Channel::ResponseStart`]
    ResponseStart(RequestEventDetails),
    /// See [`Channel::UploadProgress`]
    UploadProgress(ProgressEvent),
    /// See [`Channel::DownloadProgress`]
    DownloadProgress(ProgressEvent),
    /// See [`Channel::Response`]
    Response(ResponseEvent),
    /// See [`Channel::Loading`]
    Loading(LoadingEvent),
    /// See [`Channel::Abort`]
    Abort(RequestEventDetails),
    /// See [`Channel::Remove`]
    Remove(RequestEventDetails),
}

impl LifecycleEvent {
    /// Channel this event is published on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::RequestStart(_) => Channel::RequestStart,
            Self::ResponseStart(_) => Channel::ResponseStart,
            Self::UploadProgress(_) => Channel::UploadProgress,
            Self::DownloadProgress(_) => Channel::DownloadProgress,
            Self::Response(_) => Channel::Response,
            Self::Loading(_) => Channel::Loading,
            Self::Abort(_) => Channel::Abort,
            Self::Remove(_) => Channel::Remove,
        }
    }

    /// Request id the event belongs to.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        match self {
            Self::RequestStart(details)
            | Self::ResponseStart(details)
            | Self::Abort(details)
            | Self::Remove(details) => details.request_id,
            Self::UploadProgress(event) | Self::DownloadProgress(event) => {
                event.details.request_id
            },
            Self::Response(event) => event.details.request_id,
            Self::Loading(event) => event.request_id,
        }
    }

    /// Key-scoped topic the event is published on.
    fn key_topic(&self) -> Topic {
        let key = match self {
            Self::RequestStart(details) | Self::ResponseStart(details) | Self::Remove(details) => {
                details.request.queue_key()
            },
            Self::Abort(details) => details.request.abort_key(),
            Self::UploadProgress(event) | Self::DownloadProgress(event) => {
                event.details.request.queue_key()
            },
            Self::Response(event) => event.details.request.queue_key(),
            Self::Loading(event) => event.queue_key.clone(),
        };
        Topic::Key(self.channel(), key)
    }
}

/// Generates the key-scoped and id-scoped typed subscription methods of a channel.
macro_rules! typed_channel {
    ($on_key:ident, $on_id:ident, $variant:ident, $payload:ty, $key_doc:literal $(,)?) => {
        #[doc = concat!(
            "Subscribe to `", stringify!($variant), "` events for every request sharing ",
            $key_doc, "."
        )]
        pub fn $on_key(
            &self,
            key: impl Into<String>,
            listener: impl Fn(&$payload) + Send + Sync + 'static,
        ) -> Subscription {
            self.subscribe(Topic::Key(Channel::$variant, key.into()), move |event| {
                if let LifecycleEvent::$variant(payload) = event {
                    listener(payload);
                }
            })
        }

        #[doc = concat!("Subscribe to `", stringify!($variant), "` events of one request.")]
        pub fn $on_id(
            &self,
            request_id: RequestId,
            listener: impl Fn(&$payload) + Send + Sync + 'static,
        ) -> Subscription {
            self.subscribe(Topic::Id(Channel::$variant, request_id), move |event| {
                if let LifecycleEvent::$variant(payload) = event {
                    listener(payload);
                }
            })
        }
    };
}

/// Keyed publish/subscribe hub for request lifecycle events.
///
/// Cheap to clone; clones share the same registrations.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<ListenerRegistry<Topic, LifecycleEvent>>,
    observers: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    /// Create a bus with the default observer capacity (64).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Create a bus whose [`observe`](Self::observe) channel buffers `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(capacity.max(1));
        Self {
            registry: Arc::new(ListenerRegistry::new()),
            observers,
        }
    }

    /// Subscribe a raw listener to a topic.
    pub fn subscribe(
        &self,
        topic: Topic,
        listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.registry.subscribe(topic, Arc::new(listener))
    }

    /// Receive a copy of every event published on the bus.
    ///
    /// Slow receivers lag (see [`broadcast::error::RecvError::Lagged`]); keyed
    /// listeners are unaffected.
    #[must_use]
    pub fn observe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.observers.subscribe()
    }

    /// Number of listeners registered on a topic.
    #[must_use]
    pub fn listener_count(&self, topic: &Topic) -> usize {
        self.registry.count(topic)
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.registry.clear();
    }

    typed_channel!(
        on_request_start,
        on_request_start_by_id,
        RequestStart,
        RequestEventDetails,
        "a queue key",
    );
    typed_channel!(
        on_response_start,
        on_response_start_by_id,
        ResponseStart,
        RequestEventDetails,
        "a queue key",
    );
    typed_channel!(
        on_upload_progress,
        on_upload_progress_by_id,
        UploadProgress,
        ProgressEvent,
        "a queue key",
    );
    typed_channel!(
        on_download_progress,
        on_download_progress_by_id,
        DownloadProgress,
        ProgressEvent,
        "a queue key",
    );
    typed_channel!(on_response, on_response_by_id, Response, ResponseEvent, "a queue key");
    typed_channel!(on_loading, on_loading_by_id, Loading, LoadingEvent, "a queue key");
    typed_channel!(on_abort, on_abort_by_id, Abort, RequestEventDetails, "an abort key");
    typed_channel!(on_remove, on_remove_by_id, Remove, RequestEventDetails, "a queue key");

    /// Publish an event on its key-scoped and id-scoped topics.
    pub fn emit(&self, event: LifecycleEvent) {
        self.enqueue(event);
        self.flush();
    }

    /// Queue an event for the listeners registered right now.
    ///
    /// Sources call this under their own lock so delivery follows the order of
    /// their state changes, then [`flush`](Self::flush) once the lock is released.
    pub(crate) fn enqueue(&self, event: LifecycleEvent) {
        let topics = vec![
            event.key_topic(),
            Topic::Id(event.channel(), event.request_id()),
        ];
        tracing::trace!(
            channel = ?event.channel(),
            request_id = %event.request_id(),
            "Emitting lifecycle event"
        );

        // No observers is not an error
        let _ = self.observers.send(event.clone());
        self.registry.enqueue(topics, event);
    }

    /// Deliver queued events.
    pub(crate) fn flush(&self) {
        self.registry.flush();
    }

    /// Subscribe and queue `initial` for this listener alone, ahead of any
    /// event queued later.
    pub(crate) fn subscribe_with_initial(
        &self,
        topic: Topic,
        listener: impl Fn(&LifecycleEvent) + Send + Sync + 'static,
        initial: LifecycleEvent,
    ) -> Subscription {
        self.registry
            .subscribe_with_initial(topic, Arc::new(listener), initial)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.receiver_count())
            .finish_non_exhaustive()
    }
}
