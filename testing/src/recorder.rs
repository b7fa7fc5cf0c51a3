//! Lifecycle event capture.

use courier_runtime::Subscription;
use courier_runtime::events::{Channel, EventBus, LifecycleEvent, ResponseEvent, Topic};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const QUEUE_CHANNELS: [Channel; 7] = [
    Channel::RequestStart,
    Channel::ResponseStart,
    Channel::UploadProgress,
    Channel::DownloadProgress,
    Channel::Response,
    Channel::Loading,
    Channel::Remove,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every event published for one queue key and one abort key.
///
/// Events are stored in delivery order, across channels.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    subscription: Subscription,
}

impl EventRecorder {
    /// Subscribe to every queue-keyed channel of `queue_key` and to the abort
    /// channel of `abort_key`.
    #[must_use]
    pub fn attach(bus: &EventBus, queue_key: &str, abort_key: &str) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));

        let topics = QUEUE_CHANNELS
            .iter()
            .map(|channel| Topic::Key(*channel, queue_key.to_string()))
            .chain(std::iter::once(Topic::Key(Channel::Abort, abort_key.to_string())));

        let subscriptions = topics
            .map(|topic| {
                let events = Arc::clone(&events);
                bus.subscribe(topic, move |event| lock(&events).push(event.clone()))
            })
            .collect();

        Self {
            events,
            subscription: Subscription::merge(subscriptions),
        }
    }

    /// Every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        lock(&self.events).clone()
    }

    /// Channels of the recorded events, in order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        lock(&self.events).iter().map(LifecycleEvent::channel).collect()
    }

    /// Number of events recorded on `channel`.
    #[must_use]
    pub fn count(&self, channel: Channel) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.channel() == channel)
            .count()
    }

    /// Loading states in the order they were published.
    #[must_use]
    pub fn loading_states(&self) -> Vec<bool> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Loading(loading) => Some(loading.is_loading),
                _ => None,
            })
            .collect()
    }

    /// Number of `loading = true` events.
    #[must_use]
    pub fn loading_pulses(&self) -> usize {
        self.loading_states().into_iter().filter(|loading| *loading).count()
    }

    /// Terminal responses.
    #[must_use]
    pub fn responses(&self) -> Vec<ResponseEvent> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Response(response) => Some(response.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget what was recorded so far.
    pub fn reset(&self) {
        lock(&self.events).clear();
    }

    /// Stop recording.
    pub fn detach(&self) {
        self.subscription.unsubscribe();
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("events", &lock(&self.events).len())
            .field("subscription", &self.subscription)
            .finish()
    }
}
