use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::entry::Entry;
use crate::key::CacheKey;
use crate::utils::CallOnDrop;

/// A callback that is invoked with a snapshot of the entry on every state transition.
pub type Callback<T> = Arc<dyn Fn(&Entry<T>) + Send + Sync>;

/// Identifies one registered callback. Ids increase monotonically, which gives the
/// registration order.
pub(crate) type SubscriberId = u64;

/// Maps keys to the callbacks of their subscribers.
pub(crate) struct SubscriptionRegistry<T> {
    next_id: SubscriberId,
    by_key: HashMap<CacheKey, BTreeMap<SubscriberId, Callback<T>>>,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            by_key: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for SubscriptionRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &self.by_key.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl<T> SubscriptionRegistry<T> {
    /// Registers `callback` for `key`, returning its id and the new number of subscribers.
    pub fn register(&mut self, key: CacheKey, callback: Callback<T>) -> (SubscriberId, usize) {
        let id = self.next_id;
        self.next_id += 1;

        let callbacks = self.by_key.entry(key).or_default();
        callbacks.insert(id, callback);
        (id, callbacks.len())
    }

    /// Removes a callback, returning it along with the remaining number of subscribers of `key`.
    ///
    /// Returns `None` if the callback was not registered (anymore). The callback may own
    /// [`Subscription`]s itself, so it must not be dropped while the cache state is locked.
    pub fn unregister(
        &mut self,
        key: &CacheKey,
        id: SubscriberId,
    ) -> Option<(Callback<T>, usize)> {
        let callbacks = self.by_key.get_mut(key)?;
        let callback = callbacks.remove(&id)?;

        let remaining = callbacks.len();
        if remaining == 0 {
            self.by_key.remove(key);
        }
        Some((callback, remaining))
    }

    pub fn count(&self, key: &CacheKey) -> usize {
        self.by_key.get(key).map_or(0, BTreeMap::len)
    }

    /// Prepares a [`Notification`] of `entry` for all callbacks currently registered for its key.
    pub fn notification(&self, entry: &Entry<T>) -> Notification<T> {
        let callbacks = self
            .by_key
            .get(entry.key())
            .map(|callbacks| callbacks.values().cloned().collect())
            .unwrap_or_default();

        Notification::new(entry.clone(), callbacks)
    }
}

/// A snapshot of an entry together with the callbacks that should observe it.
///
/// Notifications are built while the cache state is locked and delivered after the lock has been
/// released, so that callbacks are free to call back into the cache.
#[must_use = "notifications do nothing unless delivered"]
pub(crate) struct Notification<T> {
    entry: Entry<T>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Notification<T> {
    pub fn new(entry: Entry<T>, callbacks: Vec<Callback<T>>) -> Self {
        Self { entry, callbacks }
    }

    /// Invokes all callbacks in registration order.
    ///
    /// A panicking callback is logged and does not keep the remaining callbacks from running.
    pub fn deliver(self) {
        for callback in &self.callbacks {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(&self.entry)));
            if result.is_err() {
                tracing::error!(key = %self.entry.key(), "subscriber callback panicked");
            }
        }
    }
}

/// A handle to an active subscription, returned by [`QueryCache::subscribe`](crate::QueryCache::subscribe).
///
/// Dropping the handle detaches the subscriber, same as calling [`unsubscribe`](Self::unsubscribe).
/// Once the last subscriber of a key detached, the entry is evicted after the configured
/// [`gc_time`](crate::CacheConfig::gc_time).
#[must_use = "dropping a subscription immediately unsubscribes"]
pub struct Subscription {
    key: CacheKey,
    _detach: CallOnDrop,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(key: CacheKey, detach: CallOnDrop) -> Self {
        Self {
            key,
            _detach: detach,
        }
    }

    /// The key this subscription observes.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Detaches this subscriber.
    pub fn unsubscribe(self) {
        drop(self)
    }
}
