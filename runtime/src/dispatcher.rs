//! Request dispatcher: per-queue-key lanes with concurrency, coalescing,
//! cancellation and retry.
//!
//! # Architecture
//!
//! ```text
//! add(request) ──► lock ──► decide (coalesce / cancel / enqueue) ──► queue events ──► unlock
//!                                                                                    │
//!                                      deliver events, spawn transport calls ◄───────┘
//!                                                  │
//!                  transport task ◄── Start ───────┘
//!                       │
//!                       └──► lock ──► complete or back off ──► queue events ──► unlock
//! ```
//!
//! Every state transition happens while the lane lock is held and produces a
//! list of effects. Their events are queued on the bus before the lock is
//! released, so listeners observe transitions in the order they were applied.
//! Delivery and transport spawns happen after the lock is released, so
//! listeners are free to call back into the dispatcher.
//!
//! Whoever removes an element from its lane under the lock emits its terminal
//! events. A transport task whose element was canceled in the meantime finds
//! its token cancelled and returns without emitting anything, so every element
//! produces exactly one terminal outcome: a response, or an abort.

use crate::cache::Cache;
use crate::events::{
    Channel, EventBus, LifecycleEvent, LoadingEvent, ProgressEvent, RequestEventDetails,
    ResponseEvent, Topic,
};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::listeners::{Subscription, lock};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use courier_core::{
    AlwaysOnline, Clock, Connectivity, Progress, ProgressSink, Request, RequestError, RequestId,
    SystemClock, Transport, TransportContext, TransportResponse, TransportSignal,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Elements of one lane allowed to run at the same time
    pub max_concurrency: usize,
    /// Revalidations of a request added less than this long ago are coalesced
    pub coalesce_window: Duration,
    /// Delay between retries
    pub retry_policy: RetryPolicy,
}

impl DispatcherConfig {
    /// Defaults: one request per lane, 50 ms coalescing window, default backoff.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_concurrency: 1,
            coalesce_window: Duration::from_millis(50),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the per-lane concurrency limit (at least 1).
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = if max_concurrency == 0 { 1 } else { max_concurrency };
        self
    }

    /// Set the coalescing window for revalidations.
    #[must_use]
    pub const fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    /// Set the retry backoff policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How a request enters the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Re-issue of a request whose data is already cached
    pub is_revalidated: bool,
    /// Result should be flagged as a refresh in the cache
    pub is_refreshed: bool,
}

impl AddOptions {
    /// Options for a revalidation.
    #[must_use]
    pub const fn revalidate() -> Self {
        Self {
            is_revalidated: true,
            is_refreshed: true,
        }
    }

    /// Options for a plain refresh.
    #[must_use]
    pub const fn refresh() -> Self {
        Self {
            is_revalidated: false,
            is_refreshed: true,
        }
    }
}

/// Scheduling state of a queue element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementStatus {
    /// Waiting for concurrency headroom
    Pending,
    /// Transport call in flight
    Running,
    /// Waiting out a retry delay
    Backoff,
}

/// One dispatched request inside a lane.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueElement {
    /// Element id
    pub request_id: RequestId,
    /// The request
    pub request: Arc<Request>,
    /// Retries performed so far
    pub retries: u32,
    /// Scheduling state
    pub status: ElementStatus,
    /// When the caller added the element
    pub added_at: DateTime<Utc>,
    /// Added as a revalidation
    pub is_revalidated: bool,
    /// Added as a refresh
    pub is_refreshed: bool,
}

impl QueueElement {
    /// Whether the element is running or waiting to be retried.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status != ElementStatus::Pending
    }
}

/// Side effect produced by a state transition, executed after the lock is released.
#[derive(Debug)]
enum Effect {
    /// Emit the start events and spawn the transport call
    Start {
        element: QueueElement,
        token: CancellationToken,
    },
    /// Emit abort then remove
    Aborted(QueueElement),
    /// Emit remove only
    Removed(QueueElement),
    /// The lane has nothing running anymore
    LoadingOff(QueueElement),
}

/// How removed elements are reported.
#[derive(Clone, Copy)]
enum Removal {
    /// Always as an abort
    Abort,
    /// As an abort when active, as a plain removal when pending
    Delete,
}

struct Slot {
    element: QueueElement,
    token: Option<CancellationToken>,
}

impl Slot {
    fn into_removal(self, removal: Removal) -> Effect {
        if let Some(token) = &self.token {
            token.cancel();
        }
        match removal {
            Removal::Delete if !self.element.is_active() => Effect::Removed(self.element),
            Removal::Abort | Removal::Delete => Effect::Aborted(self.element),
        }
    }
}

#[derive(Default)]
struct Lane {
    slots: VecDeque<Slot>,
    stopped: bool,
}

impl Lane {
    fn position(&self, request_id: RequestId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.element.request_id == request_id)
    }

    fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.element.status == ElementStatus::Running)
            .count()
    }

    fn is_active(&self) -> bool {
        self.slots.iter().any(|slot| slot.element.is_active())
    }

    /// Start pending elements in order while there is headroom.
    ///
    /// An element in backoff blocks everything behind it.
    fn schedule(&mut self, max_concurrency: usize) -> Vec<Effect> {
        if self.stopped {
            return Vec::new();
        }

        let mut running = self.running();
        let mut effects = Vec::new();
        for slot in &mut self.slots {
            if running >= max_concurrency {
                break;
            }
            match slot.element.status {
                ElementStatus::Running => {},
                ElementStatus::Backoff => break,
                ElementStatus::Pending => {
                    let token = CancellationToken::new();
                    slot.element.status = ElementStatus::Running;
                    slot.token = Some(token.clone());
                    running += 1;
                    effects.push(Effect::Start {
                        element: slot.element.clone(),
                        token,
                    });
                },
            }
        }
        effects
    }
}

#[derive(Default)]
struct State {
    lanes: HashMap<String, Lane>,
}

impl State {
    fn elements(&self) -> impl Iterator<Item = &QueueElement> {
        self.lanes
            .values()
            .flat_map(|lane| lane.slots.iter().map(|slot| &slot.element))
    }

    /// Schedule a lane after removals and report loading off when it went idle.
    fn settle(
        &mut self,
        queue_key: &str,
        removed_active: Option<QueueElement>,
        max_concurrency: usize,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let still_active = match self.lanes.get_mut(queue_key) {
            Some(lane) => {
                effects.extend(lane.schedule(max_concurrency));
                lane.is_active()
            },
            None => false,
        };
        if let Some(element) = removed_active {
            if !still_active {
                effects.push(Effect::LoadingOff(element));
            }
        }
        self.prune(queue_key);
        effects
    }

    /// Drop an empty lane unless it is stopped.
    fn prune(&mut self, queue_key: &str) {
        if self
            .lanes
            .get(queue_key)
            .is_some_and(|lane| lane.slots.is_empty() && !lane.stopped)
        {
            self.lanes.remove(queue_key);
        }
    }

    /// Remove every element matching `matches`, cancelling in-flight work.
    ///
    /// Returns the number of removed elements and the resulting effects.
    fn remove_matching<F>(
        &mut self,
        max_concurrency: usize,
        removal: Removal,
        mut matches: F,
    ) -> (usize, Vec<Effect>)
    where
        F: FnMut(&str, &QueueElement) -> bool,
    {
        let mut removed = 0;
        let mut effects = Vec::new();
        let mut touched = Vec::new();

        for (queue_key, lane) in &mut self.lanes {
            let mut last_active = None;
            let mut hit = false;
            let mut kept = VecDeque::with_capacity(lane.slots.len());
            for slot in lane.slots.drain(..) {
                if matches(queue_key.as_str(), &slot.element) {
                    hit = true;
                    removed += 1;
                    if slot.element.is_active() {
                        last_active = Some(slot.element.clone());
                    }
                    effects.push(slot.into_removal(removal));
                } else {
                    kept.push_back(slot);
                }
            }
            lane.slots = kept;

            if hit {
                touched.push((queue_key.clone(), last_active));
            }
        }

        // Every removal is reported before any lane starts its next element
        for (queue_key, last_active) in touched {
            effects.extend(self.settle(&queue_key, last_active, max_concurrency));
        }
        (removed, effects)
    }
}

/// Keeps the running-requests gauge in step with live transport tasks.
struct RunningGuard;

impl RunningGuard {
    fn new() -> Self {
        metrics::gauge!("courier_requests_running").increment(1.0);
        Self
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        metrics::gauge!("courier_requests_running").decrement(1.0);
    }
}

struct Inner {
    name: String,
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    cache: Cache,
    events: EventBus,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    connectivity: Arc<dyn Connectivity>,
    interceptors: InterceptorChain,
}

/// Queue-based request executor.
///
/// Cheap to clone; clones share lanes. Methods that may start a transport call
/// spawn it on the current Tokio runtime and must be called from within one.
///
/// # Example
///
/// ```no_run
/// use courier_core::{FnTransport, Request, TransportResponse};
/// use courier_runtime::cache::Cache;
/// use courier_runtime::dispatcher::{AddOptions, Dispatcher};
/// use courier_runtime::events::EventBus;
/// use courier_core::SystemClock;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let transport = Arc::new(FnTransport::new(|_req, _ctx| async {
///     TransportResponse::success(json!([]), 200)
/// }));
/// let cache = Cache::new(Arc::new(SystemClock));
/// let dispatcher = Dispatcher::builder(transport, cache.clone(), EventBus::new()).build();
///
/// let id = dispatcher.add(Request::new("/users"), AddOptions::default());
/// # let _ = id;
/// # }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Start building a dispatcher around a transport, a cache and an event bus.
    #[must_use]
    pub fn builder(
        transport: Arc<dyn Transport>,
        cache: Cache,
        events: EventBus,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            name: "dispatcher".to_string(),
            transport,
            cache,
            events,
            config: DispatcherConfig::default(),
            clock: None,
            connectivity: None,
            interceptors: InterceptorChain::new(),
        }
    }

    /// Name used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// The cache results are written to.
    #[must_use]
    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// The bus lifecycle events are published on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Enqueue a request.
    ///
    /// Returns the id of the element that will produce the result: a new one,
    /// or an existing one when the call was coalesced. In order:
    ///
    /// 1. A revalidation of a request added less than the coalescing window ago
    ///    is coalesced onto it.
    /// 2. A deduplicated request is coalesced onto any live request with the
    ///    same cache key.
    /// 3. A cancelable request aborts every live request sharing its abort key.
    /// 4. The element is appended to its lane and the lane is scheduled.
    pub fn add(&self, request: Request, options: AddOptions) -> RequestId {
        self.add_with(request, options, |_| ()).0
    }

    /// [`add`](Self::add), handing the id that will serve the caller to
    /// `on_assigned` before any event of that element is queued.
    ///
    /// `on_assigned` runs under the lane lock: it may subscribe to the bus but
    /// must not call back into the dispatcher.
    pub(crate) fn add_with<T>(
        &self,
        request: Request,
        options: AddOptions,
        on_assigned: impl FnOnce(RequestId) -> T,
    ) -> (RequestId, T) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let queue_key = request.queue_key();

        let (request_id, assigned, effects) = {
            let mut state = lock(&inner.state);

            if let Some(existing) = inner.coalesce_target(&state, &request, options, now) {
                let assigned = on_assigned(existing);
                tracing::debug!(
                    dispatcher = %inner.name,
                    queue_key = %queue_key,
                    request_id = %existing,
                    "Request coalesced onto live element"
                );
                metrics::counter!(
                    "courier_requests_coalesced_total",
                    "dispatcher" => inner.name.clone()
                )
                .increment(1);
                return (existing, assigned);
            }

            let request_id = RequestId::new();
            let element = QueueElement {
                request_id,
                request: Arc::new(request),
                retries: 0,
                status: ElementStatus::Pending,
                added_at: now,
                is_revalidated: options.is_revalidated,
                is_refreshed: options.is_refreshed,
            };
            let abort_key = element
                .request
                .is_cancelable()
                .then(|| element.request.abort_key());

            state
                .lanes
                .entry(queue_key.clone())
                .or_default()
                .slots
                .push_back(Slot {
                    element,
                    token: None,
                });
            let assigned = on_assigned(request_id);

            let mut effects = Vec::new();
            if let Some(abort_key) = abort_key {
                let (_, aborted) = state.remove_matching(
                    inner.config.max_concurrency,
                    Removal::Abort,
                    |_, element| {
                        element.request_id != request_id
                            && element.request.abort_key() == abort_key
                    },
                );
                effects.extend(aborted);
            }
            effects.extend(state.settle(&queue_key, None, inner.config.max_concurrency));
            inner.publish(&effects);
            (request_id, assigned, effects)
        };

        tracing::debug!(
            dispatcher = %inner.name,
            queue_key = %queue_key,
            request_id = %request_id,
            "Request enqueued"
        );
        metrics::counter!("courier_requests_enqueued_total", "dispatcher" => inner.name.clone())
            .increment(1);

        inner.run(effects);
        (request_id, assigned)
    }

    /// Head of the lane for `queue_key`.
    #[must_use]
    pub fn get(&self, queue_key: &str) -> Option<QueueElement> {
        lock(&self.inner.state)
            .lanes
            .get(queue_key)
            .and_then(|lane| lane.slots.front())
            .map(|slot| slot.element.clone())
    }

    /// Every element of the lane for `queue_key`, in order.
    #[must_use]
    pub fn get_queue(&self, queue_key: &str) -> Vec<QueueElement> {
        lock(&self.inner.state)
            .lanes
            .get(queue_key)
            .map(|lane| lane.slots.iter().map(|slot| slot.element.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove one element, cancelling its transport call if in flight.
    ///
    /// An active element is reported on the abort channel, then removed; a
    /// pending one is only removed. Returns `false` (and emits nothing) when the
    /// element is already gone.
    pub fn delete(&self, queue_key: &str, request_id: RequestId) -> bool {
        let max_concurrency = self.inner.config.max_concurrency;
        let removed = self.inner.transition(|state| {
            state.remove_matching(max_concurrency, Removal::Delete, |lane_key, element| {
                lane_key == queue_key && element.request_id == request_id
            })
        });
        removed > 0
    }

    /// Cancel every live element sharing `abort_key`, across all lanes.
    ///
    /// Returns the number of canceled elements.
    pub fn abort(&self, abort_key: &str) -> usize {
        let max_concurrency = self.inner.config.max_concurrency;
        self.inner.transition(|state| {
            state.remove_matching(max_concurrency, Removal::Abort, |_, element| {
                element.request.abort_key() == abort_key
            })
        })
    }

    /// Cancel one element by id, wherever it is queued.
    pub fn abort_by_id(&self, request_id: RequestId) -> bool {
        let max_concurrency = self.inner.config.max_concurrency;
        let removed = self.inner.transition(|state| {
            state.remove_matching(max_concurrency, Removal::Abort, |_, element| {
                element.request_id == request_id
            })
        });
        removed > 0
    }

    /// Every element whose transport call is in flight.
    #[must_use]
    pub fn get_all_running_requests(&self) -> Vec<QueueElement> {
        lock(&self.inner.state)
            .elements()
            .filter(|element| element.status == ElementStatus::Running)
            .cloned()
            .collect()
    }

    /// Whether the lane for `queue_key` has a transport call in flight.
    #[must_use]
    pub fn has_running_requests(&self, queue_key: &str) -> bool {
        lock(&self.inner.state)
            .lanes
            .get(queue_key)
            .is_some_and(|lane| lane.running() > 0)
    }

    /// Whether the lane is loading: running, or waiting to retry.
    #[must_use]
    pub fn is_loading(&self, queue_key: &str) -> bool {
        lock(&self.inner.state)
            .lanes
            .get(queue_key)
            .is_some_and(Lane::is_active)
    }

    /// Deliver the current loading state of a lane, then every change.
    pub fn get_loading(
        &self,
        queue_key: &str,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let events = &self.inner.events;
        let subscription = {
            let state = lock(&self.inner.state);
            let lane = state.lanes.get(queue_key);
            let current = LoadingEvent {
                queue_key: queue_key.to_string(),
                request_id: lane
                    .and_then(|lane| lane.slots.front())
                    .map_or_else(RequestId::new, |slot| slot.element.request_id),
                is_loading: lane.is_some_and(Lane::is_active),
                is_retry: false,
            };
            // Queued under the lane lock: no later transition can overtake it
            events.subscribe_with_initial(
                Topic::Key(Channel::Loading, queue_key.to_string()),
                move |event| {
                    if let LifecycleEvent::Loading(event) = event {
                        listener(event.is_loading);
                    }
                },
                LifecycleEvent::Loading(current),
            )
        };
        events.flush();
        subscription
    }

    /// Pause a lane.
    ///
    /// Running and backing-off elements are canceled back to pending. They stay
    /// queued, emit no terminal event, and restart with [`start`](Self::start).
    pub fn stop(&self, queue_key: &str) {
        self.inner.transition(|state| {
            let lane = state.lanes.entry(queue_key.to_string()).or_default();
            lane.stopped = true;

            let mut last_active = None;
            for slot in &mut lane.slots {
                if slot.element.is_active() {
                    if let Some(token) = slot.token.take() {
                        token.cancel();
                    }
                    slot.element.status = ElementStatus::Pending;
                    last_active = Some(slot.element.clone());
                }
            }
            ((), last_active.map(Effect::LoadingOff).into_iter().collect())
        });
        tracing::info!(dispatcher = %self.inner.name, queue_key, "Lane stopped");
    }

    /// Resume a stopped lane.
    pub fn start(&self, queue_key: &str) {
        let max_concurrency = self.inner.config.max_concurrency;
        self.inner.transition(|state| {
            if let Some(lane) = state.lanes.get_mut(queue_key) {
                lane.stopped = false;
            }
            ((), state.settle(queue_key, None, max_concurrency))
        });
        tracing::info!(dispatcher = %self.inner.name, queue_key, "Lane started");
    }

    /// Whether the lane is stopped.
    #[must_use]
    pub fn is_stopped(&self, queue_key: &str) -> bool {
        lock(&self.inner.state)
            .lanes
            .get(queue_key)
            .is_some_and(|lane| lane.stopped)
    }

    /// Cancel and remove every element of every lane, and forget stopped lanes.
    pub fn clear(&self) {
        let max_concurrency = self.inner.config.max_concurrency;
        self.inner.transition(|state| {
            for lane in state.lanes.values_mut() {
                lane.stopped = false;
            }
            let (_, effects) = state.remove_matching(max_concurrency, Removal::Delete, |_, _| true);
            state.lanes.clear();
            ((), effects)
        });
        tracing::debug!(dispatcher = %self.inner.name, "Dispatcher cleared");
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("lanes", &lock(&self.inner.state).lanes.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Live element a new request should piggyback on, if any.
    fn coalesce_target(
        &self,
        state: &State,
        request: &Request,
        options: AddOptions,
        now: DateTime<Utc>,
    ) -> Option<RequestId> {
        let cache_key = request.cache_key();
        let same_call = |element: &&QueueElement| {
            element.request.cache_key() == cache_key && element.request.body() == request.body()
        };

        if options.is_revalidated {
            let window = self.config.coalesce_window;
            let recent = state.elements().filter(same_call).find(|element| {
                (now - element.added_at)
                    .to_std()
                    .map_or(true, |elapsed| elapsed <= window)
            });
            if let Some(element) = recent {
                return Some(element.request_id);
            }
        }

        if request.is_deduplicated() {
            return state.elements().find(same_call).map(|element| element.request_id);
        }
        None
    }

    fn details(&self, element: &QueueElement) -> RequestEventDetails {
        RequestEventDetails {
            request_id: element.request_id,
            request: Arc::clone(&element.request),
            retries: element.retries,
            timestamp: self.clock.now(),
            is_revalidated: element.is_revalidated,
            is_refreshed: element.is_refreshed,
        }
    }

    /// Apply a transition under the state lock, queue its events, then run
    /// its effects once the lock is released.
    fn transition<R>(self: &Arc<Self>, apply: impl FnOnce(&mut State) -> (R, Vec<Effect>)) -> R {
        let (result, effects) = {
            let mut state = lock(&self.state);
            let (result, effects) = apply(&mut *state);
            self.publish(&effects);
            (result, effects)
        };
        self.run(effects);
        result
    }

    /// Queue the events of a transition and update cache loading flags.
    ///
    /// Called with the state lock held.
    fn publish(&self, effects: &[Effect]) {
        for effect in effects {
            match effect {
                Effect::Start { element, .. } => {
                    self.cache.set_loading(&element.request.cache_key(), true);
                    self.events.enqueue(LifecycleEvent::Loading(LoadingEvent {
                        queue_key: element.request.queue_key(),
                        request_id: element.request_id,
                        is_loading: true,
                        is_retry: element.retries > 0,
                    }));
                    self.events
                        .enqueue(LifecycleEvent::RequestStart(self.details(element)));
                },
                Effect::Aborted(element) => {
                    let details = self.details(element);
                    self.events.enqueue(LifecycleEvent::Abort(details.clone()));
                    self.events.enqueue(LifecycleEvent::Remove(details));
                },
                Effect::Removed(element) => {
                    self.events
                        .enqueue(LifecycleEvent::Remove(self.details(element)));
                },
                Effect::LoadingOff(element) => {
                    self.cache.set_loading(&element.request.cache_key(), false);
                    self.events.enqueue(LifecycleEvent::Loading(LoadingEvent {
                        queue_key: element.request.queue_key(),
                        request_id: element.request_id,
                        is_loading: false,
                        is_retry: false,
                    }));
                },
            }
        }
    }

    /// Deliver queued events, then spawn transport calls.
    fn run(self: &Arc<Self>, effects: Vec<Effect>) {
        self.events.flush();
        for effect in effects {
            match effect {
                Effect::Start { element, token } => {
                    tracing::debug!(
                        dispatcher = %self.name,
                        request_id = %element.request_id,
                        attempt = element.retries,
                        "Starting transport call"
                    );
                    metrics::counter!(
                        "courier_requests_started_total",
                        "dispatcher" => self.name.clone()
                    )
                    .increment(1);
                    tokio::spawn(Arc::clone(self).execute(element, token));
                },
                Effect::Aborted(element) => {
                    tracing::info!(
                        dispatcher = %self.name,
                        request_id = %element.request_id,
                        abort_key = %element.request.abort_key(),
                        "Request aborted"
                    );
                    metrics::counter!(
                        "courier_requests_canceled_total",
                        "dispatcher" => self.name.clone()
                    )
                    .increment(1);
                },
                Effect::Removed(_) | Effect::LoadingOff(_) => {},
            }
        }
    }

    /// One attempt of one element.
    async fn execute(self: Arc<Self>, element: QueueElement, token: CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let running = RunningGuard::new();

        let request = match self.interceptors.apply_request((*element.request).clone()) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(
                    dispatcher = %self.name,
                    request_id = %element.request_id,
                    error = %error,
                    "Request rejected by interceptor"
                );
                self.complete(&element, &token, Err(error));
                return;
            },
        };

        let response_started = Arc::new(AtomicBool::new(false));
        let context = TransportContext::new(
            token.clone(),
            self.progress_sink(&element, &token, Arc::clone(&response_started)),
        );

        let started = tokio::time::Instant::now();
        let response = tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::trace!(
                    request_id = %element.request_id,
                    "Transport call dropped after cancellation"
                );
                return;
            }
            response = self.transport.perform(&request, context) => response,
        };
        metrics::histogram!("courier_request_duration_seconds", "dispatcher" => self.name.clone())
            .record(started.elapsed().as_secs_f64());
        drop(running);

        if token.is_cancelled() {
            return;
        }
        if !response_started.swap(true, Ordering::SeqCst) {
            self.events
                .emit(LifecycleEvent::ResponseStart(self.details(&element)));
        }

        match self.classify(response, &request) {
            Err(error) if error.is_retryable() && element.retries < element.request.retry() => {
                self.retry(element, token, error).await;
            },
            outcome => self.complete(&element, &token, outcome),
        }
    }

    fn progress_sink(
        &self,
        element: &QueueElement,
        token: &CancellationToken,
        response_started: Arc<AtomicBool>,
    ) -> ProgressSink {
        let events = self.events.clone();
        let clock = Arc::clone(&self.clock);
        let token = token.clone();
        let details = self.details(element);
        let started_at = details.timestamp;

        ProgressSink::new(move |signal| {
            if token.is_cancelled() {
                return;
            }
            match signal {
                TransportSignal::UploadProgress { loaded, total } => {
                    events.emit(LifecycleEvent::UploadProgress(ProgressEvent {
                        details: details.clone(),
                        progress: Progress::calculate(loaded, total, started_at, clock.now()),
                    }));
                },
                TransportSignal::ResponseStart => {
                    if !response_started.swap(true, Ordering::SeqCst) {
                        events.emit(LifecycleEvent::ResponseStart(details.clone()));
                    }
                },
                TransportSignal::DownloadProgress { loaded, total } => {
                    events.emit(LifecycleEvent::DownloadProgress(ProgressEvent {
                        details: details.clone(),
                        progress: Progress::calculate(loaded, total, started_at, clock.now()),
                    }));
                },
            }
        })
    }

    /// Run response interceptors and turn a failed response into an error.
    fn classify(
        &self,
        response: TransportResponse,
        request: &Request,
    ) -> Result<TransportResponse, RequestError> {
        let mut response = self.interceptors.apply_response(response, request)?;
        match response.error.take() {
            None => Ok(response),
            Some(payload) if self.connectivity.is_online() => Err(RequestError::Transport {
                status: response.status,
                payload,
            }),
            Some(payload) => Err(RequestError::Offline {
                status: response.status,
                payload,
            }),
        }
    }

    /// Move the element to the tail of its lane, wait out the backoff, then make
    /// it eligible again.
    async fn retry(
        self: Arc<Self>,
        element: QueueElement,
        token: CancellationToken,
        error: RequestError,
    ) {
        let queue_key = element.request.queue_key();
        let delay = self.config.retry_policy.delay_for_attempt(element.retries);

        let effects = {
            let mut state = lock(&self.state);
            if token.is_cancelled() {
                return;
            }
            let Some(lane) = state.lanes.get_mut(&queue_key) else {
                return;
            };
            let Some(mut slot) = lane
                .position(element.request_id)
                .and_then(|index| lane.slots.remove(index))
            else {
                return;
            };
            slot.element.retries += 1;
            slot.element.status = ElementStatus::Backoff;
            lane.slots.push_back(slot);
            let effects = lane.schedule(self.config.max_concurrency);
            self.publish(&effects);
            effects
        };

        tracing::warn!(
            dispatcher = %self.name,
            request_id = %element.request_id,
            attempt = element.retries + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Request failed, retrying after delay"
        );
        metrics::counter!("courier_requests_retried_total", "dispatcher" => self.name.clone())
            .increment(1);
        self.run(effects);

        tokio::select! {
            biased;
            () = token.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let effects = {
            let mut state = lock(&self.state);
            if token.is_cancelled() {
                return;
            }
            let Some(lane) = state.lanes.get_mut(&queue_key) else {
                return;
            };
            let Some(index) = lane.position(element.request_id) else {
                return;
            };
            if let Some(slot) = lane.slots.get_mut(index) {
                slot.element.status = ElementStatus::Pending;
                slot.token = None;
            }
            let effects = lane.schedule(self.config.max_concurrency);
            self.publish(&effects);
            effects
        };
        self.run(effects);
    }

    /// Terminal outcome: remove the element, write the cache, publish.
    fn complete(
        self: &Arc<Self>,
        element: &QueueElement,
        token: &CancellationToken,
        outcome: Result<TransportResponse, RequestError>,
    ) {
        let queue_key = element.request.queue_key();
        let cache_key = element.request.cache_key();

        let next = {
            let mut state = lock(&self.state);
            if token.is_cancelled() {
                return;
            }
            let Some(lane) = state.lanes.get_mut(&queue_key) else {
                return;
            };
            let Some(index) = lane.position(element.request_id) else {
                return;
            };
            lane.slots.remove(index);

            let next = lane.schedule(self.config.max_concurrency);
            let loading_off = !lane.is_active();
            let cache_still_loading = lane.slots.iter().any(|slot| {
                slot.element.status == ElementStatus::Running
                    && slot.element.request.cache_key() == cache_key
            });
            state.prune(&queue_key);

            self.record(element, &cache_key, &outcome);
            if cache_still_loading {
                self.cache.set_loading(&cache_key, true);
            }

            let details = self.details(element);
            self.events.enqueue(LifecycleEvent::Response(ResponseEvent {
                details: details.clone(),
                outcome,
            }));
            if loading_off {
                self.events.enqueue(LifecycleEvent::Loading(LoadingEvent {
                    queue_key,
                    request_id: element.request_id,
                    is_loading: false,
                    is_retry: false,
                }));
            }
            self.events.enqueue(LifecycleEvent::Remove(details));
            self.publish(&next);
            next
        };

        self.cache.flush();
        self.run(next);
    }

    /// Write a terminal outcome to the cache and report it.
    fn record(
        &self,
        element: &QueueElement,
        cache_key: &str,
        outcome: &Result<TransportResponse, RequestError>,
    ) {
        match outcome {
            Ok(response) => {
                self.cache
                    .store(cache_key, response, element.retries, element.is_refreshed);
                metrics::counter!(
                    "courier_requests_succeeded_total",
                    "dispatcher" => self.name.clone()
                )
                .increment(1);
                tracing::debug!(
                    dispatcher = %self.name,
                    request_id = %element.request_id,
                    status = response.status,
                    "Request succeeded"
                );
            },
            Err(error) => {
                if let Some(status) = error.status() {
                    self.cache.store(
                        cache_key,
                        &TransportResponse::failure(error.payload(), status),
                        element.retries,
                        element.is_refreshed,
                    );
                }
                metrics::counter!(
                    "courier_requests_failed_total",
                    "dispatcher" => self.name.clone()
                )
                .increment(1);
                if error.is_retryable() && element.request.retry() > 0 {
                    tracing::error!(
                        dispatcher = %self.name,
                        request_id = %element.request_id,
                        retries = element.retries,
                        error = %error,
                        "Request failed after exhausting retries"
                    );
                } else {
                    tracing::warn!(
                        dispatcher = %self.name,
                        request_id = %element.request_id,
                        error = %error,
                        "Request failed"
                    );
                }
            },
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    name: String,
    transport: Arc<dyn Transport>,
    cache: Cache,
    events: EventBus,
    config: DispatcherConfig,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<Arc<dyn Connectivity>>,
    interceptors: InterceptorChain,
}

impl DispatcherBuilder {
    /// Name used in logs and metric labels.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Dispatcher configuration.
    #[must_use]
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for coalescing windows and event timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Connectivity probe used to classify failures.
    #[must_use]
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Append one interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Replace the interceptor chain.
    #[must_use]
    pub fn interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Build the dispatcher.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                name: self.name,
                state: Mutex::new(State::default()),
                transport: self.transport,
                cache: self.cache,
                events: self.events,
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                connectivity: self.connectivity.unwrap_or_else(|| Arc::new(AlwaysOnline)),
                interceptors: self.interceptors,
            }),
        }
    }
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}
