//! Keyed listener registry shared by the cache and the lifecycle event bus.
//!
//! Listeners are stored per key in registration order and identified by a
//! numeric handle, so unsubscribing removes exactly one registration even when
//! the same closure was registered twice.
//!
//! # Delivery
//!
//! Emissions go through a FIFO delivery queue. The first emitter drains the
//! queue; emissions made while a drain is in progress (from inside a listener or
//! from another thread) are appended and delivered by the active drainer, in
//! order. This keeps delivery order equal to emission order without holding a
//! lock while user code runs.
//!
//! An event reaches only the listeners registered when it was queued. Sources
//! that must order writes against subscriptions queue under their own lock
//! ([`ListenerRegistry::enqueue`], [`ListenerRegistry::subscribe_with_initial`])
//! and flush after releasing it.
//!
//! Before each listener call the registration is re-checked, so a listener
//! removed by an earlier listener of the same emission is not called.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared listener callback.
pub(crate) type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one listener registration.
///
/// Call [`Subscription::unsubscribe`] to remove the listener. Calling it more
/// than once is a no-op. Dropping the handle does **not** unsubscribe, so
/// fire-and-forget registrations stay alive for the lifetime of their source.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Combine several registrations into one handle.
    #[must_use]
    pub fn merge(subscriptions: Vec<Self>) -> Self {
        Self::new(move || {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    /// Remove the listener.
    pub fn unsubscribe(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    /// Whether [`Self::unsubscribe`] has not been called yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.cancel).is_some()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

struct Slots<K, E> {
    next_id: u64,
    listeners: HashMap<K, Vec<(u64, Listener<E>)>>,
}

impl<K: Hash + Eq, E> Slots<K, E> {
    fn contains(&self, key: &K, id: u64) -> bool {
        self.listeners
            .get(key)
            .is_some_and(|entries| entries.iter().any(|(entry_id, _)| *entry_id == id))
    }
}

/// One queued delivery.
enum Pending<K, E> {
    /// To every listener of `keys` registered before the event was queued
    Broadcast {
        keys: Vec<K>,
        event: E,
        watermark: u64,
    },
    /// To a single registration
    Direct { key: K, id: u64, event: E },
}

struct Delivery<K, E> {
    pending: VecDeque<Pending<K, E>>,
    draining: bool,
}

/// Resets the draining flag when a listener panics mid-drain.
struct DrainGuard<'a, K, E> {
    delivery: &'a Mutex<Delivery<K, E>>,
    armed: bool,
}

impl<K, E> Drop for DrainGuard<'_, K, E> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.delivery).draining = false;
        }
    }
}

/// Keyed, ordered listener storage with queued delivery.
pub(crate) struct ListenerRegistry<K, E> {
    slots: Arc<Mutex<Slots<K, E>>>,
    delivery: Mutex<Delivery<K, E>>,
}

impl<K, E> ListenerRegistry<K, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                listeners: HashMap::new(),
            })),
            delivery: Mutex::new(Delivery {
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    fn register(
        &self,
        slots: &mut Slots<K, E>,
        key: K,
        listener: Listener<E>,
    ) -> (u64, Subscription) {
        let id = slots.next_id;
        slots.next_id += 1;
        slots.listeners.entry(key.clone()).or_default().push((id, listener));

        let weak = Arc::downgrade(&self.slots);
        let subscription = Subscription::new(move || {
            let Some(slots) = weak.upgrade() else {
                return;
            };
            let mut slots = lock(&slots);
            if let Some(entries) = slots.listeners.get_mut(&key) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    slots.listeners.remove(&key);
                }
            }
        });
        (id, subscription)
    }

    /// Register `listener` under `key`.
    pub(crate) fn subscribe(&self, key: K, listener: Listener<E>) -> Subscription {
        let mut slots = lock(&self.slots);
        self.register(&mut slots, key, listener).1
    }

    /// Register `listener` under `key` and queue `initial` for it alone.
    ///
    /// Nothing is delivered until the next [`flush`](Self::flush) or
    /// [`emit`](Self::emit). Calling this while holding the lock that guards
    /// the source of `initial` orders it before every later write of that
    /// source.
    pub(crate) fn subscribe_with_initial(
        &self,
        key: K,
        listener: Listener<E>,
        initial: E,
    ) -> Subscription {
        let mut slots = lock(&self.slots);
        let (id, subscription) = self.register(&mut slots, key.clone(), listener);
        lock(&self.delivery).pending.push_back(Pending::Direct {
            key,
            id,
            event: initial,
        });
        subscription
    }

    /// Queue `event` for every listener currently registered under any of `keys`.
    ///
    /// Listeners registered afterwards do not receive it.
    pub(crate) fn enqueue(&self, keys: Vec<K>, event: E) {
        let slots = lock(&self.slots);
        lock(&self.delivery).pending.push_back(Pending::Broadcast {
            keys,
            event,
            watermark: slots.next_id,
        });
    }

    /// Deliver everything queued, unless another caller is already draining.
    pub(crate) fn flush(&self) {
        {
            let mut delivery = lock(&self.delivery);
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        let mut guard = DrainGuard {
            delivery: &self.delivery,
            armed: true,
        };
        loop {
            let next = {
                let mut delivery = lock(&self.delivery);
                let next = delivery.pending.pop_front();
                if next.is_none() {
                    // Same critical section as the empty pop: a concurrent
                    // emitter either queued before it or drains on its own
                    delivery.draining = false;
                }
                next
            };
            match next {
                Some(pending) => self.deliver(pending),
                None => {
                    guard.armed = false;
                    return;
                },
            }
        }
    }

    /// Queue `event` for every listener of `keys` and deliver it.
    pub(crate) fn emit(&self, keys: Vec<K>, event: E) {
        self.enqueue(keys, event);
        self.flush();
    }

    fn deliver(&self, pending: Pending<K, E>) {
        match pending {
            Pending::Broadcast {
                keys,
                event,
                watermark,
            } => {
                for key in &keys {
                    let snapshot: Vec<(u64, Listener<E>)> = lock(&self.slots)
                        .listeners
                        .get(key)
                        .map(|entries| {
                            entries
                                .iter()
                                .filter(|(id, _)| *id < watermark)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();

                    for (id, listener) in snapshot {
                        if lock(&self.slots).contains(key, id) {
                            listener(&event);
                        }
                    }
                }
            },
            Pending::Direct { key, id, event } => {
                let listener = lock(&self.slots).listeners.get(&key).and_then(|entries| {
                    entries
                        .iter()
                        .find(|(entry_id, _)| *entry_id == id)
                        .map(|(_, listener)| Arc::clone(listener))
                });
                if let Some(listener) = listener {
                    listener(&event);
                }
            },
        }
    }

    /// Number of listeners registered under `key`.
    pub(crate) fn count(&self, key: &K) -> usize {
        lock(&self.slots).listeners.get(key).map_or(0, Vec::len)
    }

    /// Drop every registration.
    pub(crate) fn clear(&self) {
        lock(&self.slots).listeners.clear();
    }
}
