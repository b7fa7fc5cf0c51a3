//! In-memory response cache with per-key change notifications.
//!
//! The cache holds the last known response state per cache key. Entries are
//! overwritten, never merged, on every write. Nothing is evicted
//! automatically; callers layer their own staleness policy on top of the entry
//! timestamp (see [`Cache::is_stale`]) and invalidate explicitly.
//!
//! The dispatcher is the only writer in normal operation. Everyone else reads
//! through [`Cache::get`] or listens through [`Cache::events`].
//!
//! # Example
//!
//! ```
//! use courier_core::{SystemClock, TransportResponse};
//! use courier_runtime::cache::Cache;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let cache = Cache::new(Arc::new(SystemClock));
//! let subscription = cache.events().on_data("GET_/users", |entry| {
//!     println!("users changed: {:?}", entry.data);
//! });
//!
//! cache.set("GET_/users", &TransportResponse::success(json!([]), 200), 0, false);
//! assert_eq!(cache.get("GET_/users").and_then(|e| e.data), Some(json!([])));
//! subscription.unsubscribe();
//! ```

use crate::listeners::{Listener, ListenerRegistry, Subscription, lock};
use chrono::{DateTime, Utc};
use courier_core::{Clock, TransportResponse};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Last known state of one cache key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheEntry {
    /// Last response payload (`None` after a failure)
    pub data: Option<Value>,
    /// Last error payload (`None` after a success)
    pub error: Option<Value>,
    /// Status code of the last response
    pub status: u16,
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    /// Retries the dispatcher needed to produce this response
    pub retries: u32,
    /// Whether the entry came from a refresh rather than a first load
    pub is_refreshed: bool,
    /// Whether a request for this key is currently running
    pub is_loading: bool,
}

struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    data_listeners: ListenerRegistry<String, CacheEntry>,
    revalidate_listeners: ListenerRegistry<String, String>,
}

/// Keyed response store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Create an empty cache timestamping entries with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                clock,
                data_listeners: ListenerRegistry::new(),
                revalidate_listeners: ListenerRegistry::new(),
            }),
        }
    }

    /// Current entry for `cache_key`.
    #[must_use]
    pub fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        lock(&self.inner.entries).get(cache_key).cloned()
    }

    /// Overwrite the entry for `cache_key` and notify its data listeners.
    ///
    /// `retries` is passed through from the dispatcher; the cache never counts.
    pub fn set(
        &self,
        cache_key: &str,
        response: &TransportResponse,
        retries: u32,
        is_refreshed: bool,
    ) {
        self.store(cache_key, response, retries, is_refreshed);
        self.flush();
    }

    /// Overwrite an entry and queue its notification without delivering it.
    ///
    /// Lets a caller write under its own lock; [`flush`](Self::flush) after
    /// releasing it.
    pub(crate) fn store(
        &self,
        cache_key: &str,
        response: &TransportResponse,
        retries: u32,
        is_refreshed: bool,
    ) {
        let entry = CacheEntry {
            data: response.data.clone(),
            error: response.error.clone(),
            status: response.status,
            timestamp: self.inner.clock.now(),
            retries,
            is_refreshed,
            is_loading: false,
        };

        {
            // Queued under the entries lock so notifications follow write order
            let mut entries = lock(&self.inner.entries);
            entries.insert(cache_key.to_string(), entry.clone());
            self.inner
                .data_listeners
                .enqueue(vec![cache_key.to_string()], entry);
        }
        metrics::counter!("courier_cache_writes_total").increment(1);
        tracing::debug!(
            cache_key,
            status = response.status,
            failed = response.is_failed(),
            "Cache entry written"
        );
    }

    /// Deliver queued data notifications.
    pub(crate) fn flush(&self) {
        self.inner.data_listeners.flush();
    }

    /// Update the loading flag of an existing entry without notifying data listeners.
    ///
    /// Returns `false` when there is no entry for the key.
    pub fn set_loading(&self, cache_key: &str, is_loading: bool) -> bool {
        lock(&self.inner.entries)
            .get_mut(cache_key)
            .map(|entry| entry.is_loading = is_loading)
            .is_some()
    }

    /// Remove the entry for `cache_key`.
    pub fn delete(&self, cache_key: &str) -> Option<CacheEntry> {
        lock(&self.inner.entries).remove(cache_key)
    }

    /// Remove the entry and ask revalidation listeners to re-issue the request.
    pub fn invalidate(&self, cache_key: &str) {
        self.delete(cache_key);
        tracing::debug!(cache_key, "Cache entry invalidated");
        self.inner
            .revalidate_listeners
            .emit(vec![cache_key.to_string()], cache_key.to_string());
    }

    /// Whether the entry is missing or older than `max_age`.
    #[must_use]
    pub fn is_stale(&self, cache_key: &str, max_age: Duration) -> bool {
        let Some(entry) = self.get(cache_key) else {
            return true;
        };
        let age = self.inner.clock.now() - entry.timestamp;
        age.to_std().map_or(false, |age| age > max_age)
    }

    /// Keys currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.entries).keys().cloned().collect()
    }

    /// Remove every entry. Listeners stay registered.
    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }

    /// Subscription API.
    #[must_use]
    pub fn events(&self) -> CacheEvents {
        CacheEvents {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &lock(&self.inner.entries).len())
            .finish_non_exhaustive()
    }
}

/// Per-key change notifications of a [`Cache`].
#[derive(Clone)]
pub struct CacheEvents {
    inner: Arc<CacheInner>,
}

impl CacheEvents {
    /// Call `listener` with every future write to `cache_key`.
    ///
    /// Past writes are not replayed.
    pub fn on_data(
        &self,
        cache_key: impl Into<String>,
        listener: impl Fn(&CacheEntry) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .data_listeners
            .subscribe(cache_key.into(), Arc::new(listener))
    }

    /// Deliver the current entry (if any) to `listener`, then subscribe it to
    /// future writes.
    pub fn get(
        &self,
        cache_key: impl Into<String>,
        listener: impl Fn(&CacheEntry) + Send + Sync + 'static,
    ) -> Subscription {
        let cache_key = cache_key.into();
        let listener: Listener<CacheEntry> = Arc::new(listener);
        let registry = &self.inner.data_listeners;

        let subscription = {
            let entries = lock(&self.inner.entries);
            match entries.get(&cache_key).cloned() {
                Some(current) => registry.subscribe_with_initial(cache_key, listener, current),
                None => registry.subscribe(cache_key, listener),
            }
        };

        registry.flush();
        subscription
    }

    /// Call `listener` whenever `cache_key` is invalidated.
    pub fn on_revalidate(
        &self,
        cache_key: impl Into<String>,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.revalidate_listeners.subscribe(
            cache_key.into(),
            Arc::new(move |key: &String| listener(key)),
        )
    }

    /// Number of data listeners registered for `cache_key`.
    #[must_use]
    pub fn listener_count(&self, cache_key: &str) -> usize {
        self.inner.data_listeners.count(&cache_key.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use courier_testing::ManualClock;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Cache, ManualClock) {
        let clock = ManualClock::default();
        (Cache::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_set_overwrites_without_merging() {
        let (cache, _clock) = cache();

        cache.set("k", &TransportResponse::success(json!({"a": 1}), 200), 0, false);
        cache.set("k", &TransportResponse::failure(json!("boom"), 500), 2, true);

        let entry = cache.get("k").unwrap();
        assert_eq!(entry.data, None);
        assert_eq!(entry.error, Some(json!("boom")));
        assert_eq!(entry.status, 500);
        assert_eq!(entry.retries, 2);
        assert!(entry.is_refreshed);
    }

    #[test]
    fn test_on_data_only_sees_future_writes() {
        let (cache, _clock) = cache();
        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = cache.events().on_data("k", move |entry| {
            seen_clone.lock().unwrap().push(entry.data.clone());
        });
        cache.set("k", &TransportResponse::success(json!(2), 200), 0, false);
        cache.set("other", &TransportResponse::success(json!(3), 200), 0, false);

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(2))]);
    }

    #[test]
    fn test_events_get_delivers_current_then_future() {
        let (cache, _clock) = cache();
        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = cache.events().get("k", move |entry| {
            seen_clone.lock().unwrap().push(entry.data.clone());
        });
        cache.set("k", &TransportResponse::success(json!(2), 200), 0, false);
        sub.unsubscribe();
        cache.set("k", &TransportResponse::success(json!(3), 200), 0, false);

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_events_get_without_entry_waits() {
        let (cache, _clock) = cache();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let _sub = cache.events().get("k", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribing_one_listener_keeps_the_other() {
        let (cache, _clock) = cache();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_clone = Arc::clone(&first);
        let second_clone = Arc::clone(&second);

        let sub_first = cache.events().on_data("k", move |_| {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_second = cache.events().on_data("k", move |_| {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });
        sub_first.unsubscribe();
        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(cache.events().listener_count("k"), 1);
    }

    #[test]
    fn test_staleness_follows_clock() {
        let (cache, clock) = cache();
        assert!(cache.is_stale("k", Duration::from_secs(60)));

        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);
        assert!(!cache.is_stale("k", Duration::from_secs(60)));

        clock.advance(Duration::from_secs(61));
        assert!(cache.is_stale("k", Duration::from_secs(60)));
    }

    #[test]
    fn test_loading_flag_is_silent() {
        let (cache, _clock) = cache();
        assert!(!cache.set_loading("k", true));

        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let _sub = cache.events().on_data("k", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(cache.set_loading("k", true));
        assert!(cache.get("k").unwrap().is_loading);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalidate_notifies_and_removes() {
        let (cache, _clock) = cache();
        cache.set("k", &TransportResponse::success(json!(1), 200), 0, false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = cache.events().on_revalidate("k", move |key| {
            seen_clone.lock().unwrap().push(key.to_string());
        });
        cache.invalidate("k");

        assert!(cache.get("k").is_none());
        assert_eq!(*seen.lock().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_clear_and_keys() {
        let (cache, _clock) = cache();
        cache.set("a", &TransportResponse::success(json!(1), 200), 0, false);
        cache.set("b", &TransportResponse::success(json!(2), 200), 0, false);

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        cache.clear();
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_events_get_never_delivers_stale_value_after_newer_one() {
        let (cache, _clock) = cache();
        cache.set("k", &TransportResponse::success(json!(0), 200), 0, false);

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for value in 1..=2000 {
                    cache.set("k", &TransportResponse::success(json!(value), 200), 0, false);
                }
            })
        };

        let mut sequences = Vec::new();
        while !writer.is_finished() {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = Arc::clone(&seen);
            let sub = cache.events().get("k", move |entry| {
                let value = entry.data.as_ref().and_then(serde_json::Value::as_i64).unwrap();
                seen_clone.lock().unwrap().push(value);
            });
            std::thread::yield_now();
            sub.unsubscribe();
            sequences.push(seen);
        }
        writer.join().unwrap();

        for seen in sequences {
            let seen = seen.lock().unwrap();
            assert!(
                seen.windows(2).all(|pair| pair[0] < pair[1]),
                "out of order delivery: {seen:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_last_write_wins(
            writes in proptest::collection::vec((any::<i64>(), any::<bool>()), 1..20),
        ) {
            let (cache, _clock) = cache();
            for (value, failed) in &writes {
                let response = if *failed {
                    TransportResponse::failure(json!(value), 500)
                } else {
                    TransportResponse::success(json!(value), 200)
                };
                cache.set("k", &response, 0, false);
            }

            let (value, failed) = writes[writes.len() - 1];
            let entry = cache.get("k").unwrap();
            if failed {
                prop_assert_eq!(entry.error, Some(json!(value)));
                prop_assert_eq!(entry.data, None);
            } else {
                prop_assert_eq!(entry.data, Some(json!(value)));
                prop_assert_eq!(entry.error, None);
            }
        }
    }
}
