use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{CacheError, FetchError};
use crate::key::CacheKey;

/// The lifecycle state of an [`Entry`].
///
/// ```text
/// Idle -> Loading -> Success | Error
/// Success -> Loading   (invalidated or stale)
/// Error -> Loading     (retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Nothing has been fetched for this key yet.
    Idle,
    /// A fetch is running. A previously fetched value may still be available.
    Loading,
    /// The latest fetch succeeded.
    Success,
    /// The latest fetch failed, see [`Entry::error`].
    Error,
}

/// The cached state of a single [`CacheKey`].
///
/// Entries handed out by the cache are snapshots; the value itself is shared via an [`Arc`],
/// which makes snapshots cheap to clone.
#[derive(Debug)]
pub struct Entry<T> {
    key: CacheKey,
    value: Option<Arc<T>>,
    status: Status,
    error: Option<FetchError>,
    generation: u64,
    last_updated: Option<Instant>,
    subscriber_count: usize,
    failure_count: u32,
    is_invalidated: bool,
}

// Not derived, as that would require `T: Clone`.
impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            status: self.status,
            error: self.error.clone(),
            generation: self.generation,
            last_updated: self.last_updated,
            subscriber_count: self.subscriber_count,
            failure_count: self.failure_count,
            is_invalidated: self.is_invalidated,
        }
    }
}

impl<T> Entry<T> {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            status: Status::Idle,
            error: None,
            generation: 0,
            last_updated: None,
            subscriber_count: 0,
            failure_count: 0,
            is_invalidated: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The most recently fetched value.
    ///
    /// The value is kept while a refetch is [`Loading`](Status::Loading) and after it failed.
    pub fn value(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The error of the latest failed fetch, if the entry is in [`Status::Error`].
    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    /// The generation of the most recently started fetch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When a value was last stored successfully.
    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// The number of consecutive failures within the current generation.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether the entry was explicitly invalidated and has not been refetched since.
    pub fn is_invalidated(&self) -> bool {
        self.is_invalidated
    }

    /// Whether a successful value is older than `stale_time`, or was invalidated.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match (self.status, self.last_updated) {
            (Status::Success, Some(updated)) => updated + stale_time <= Instant::now(),
            _ => false,
        }
    }

    fn apply(&mut self, patch: EntryPatch<T>) {
        let EntryPatch {
            value,
            status,
            error,
            generation,
            last_updated,
            subscriber_count,
            failure_count,
            is_invalidated,
        } = patch;

        if let Some(value) = value {
            self.value = Some(value);
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(error) = error {
            self.error = error;
        }
        if let Some(generation) = generation {
            self.generation = generation;
        }
        if let Some(last_updated) = last_updated {
            self.last_updated = Some(last_updated);
        }
        if let Some(subscriber_count) = subscriber_count {
            self.subscriber_count = subscriber_count;
        }
        if let Some(failure_count) = failure_count {
            self.failure_count = failure_count;
        }
        if let Some(is_invalidated) = is_invalidated {
            self.is_invalidated = is_invalidated;
        }
    }
}

/// A partial update of an [`Entry`], merged via [`EntryStore::upsert`].
///
/// Fields that are left unset keep their current value.
#[derive(Debug)]
pub struct EntryPatch<T> {
    value: Option<Arc<T>>,
    status: Option<Status>,
    error: Option<Option<FetchError>>,
    generation: Option<u64>,
    last_updated: Option<Instant>,
    subscriber_count: Option<usize>,
    failure_count: Option<u32>,
    is_invalidated: Option<bool>,
}

impl<T> Default for EntryPatch<T> {
    fn default() -> Self {
        Self {
            value: None,
            status: None,
            error: None,
            generation: None,
            last_updated: None,
            subscriber_count: None,
            failure_count: None,
            is_invalidated: None,
        }
    }
}

impl<T> EntryPatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, value: Arc<T>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error(mut self, error: FetchError) -> Self {
        self.error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn last_updated(mut self, at: Instant) -> Self {
        self.last_updated = Some(at);
        self
    }

    pub fn subscriber_count(mut self, count: usize) -> Self {
        self.subscriber_count = Some(count);
        self
    }

    pub fn failure_count(mut self, count: u32) -> Self {
        self.failure_count = Some(count);
        self
    }

    pub fn invalidated(mut self, is_invalidated: bool) -> Self {
        self.is_invalidated = Some(is_invalidated);
        self
    }
}

/// Holds exactly one [`Entry`] per [`CacheKey`].
#[derive(Debug)]
pub struct EntryStore<T> {
    entries: HashMap<CacheKey, Entry<T>>,
}

impl<T> Default for EntryStore<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> EntryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry for `key`, without any side effects.
    pub fn get(&self, key: &CacheKey) -> Option<&Entry<T>> {
        self.entries.get(key)
    }

    /// Merges `patch` into the entry for `key`, creating an [`Idle`](Status::Idle) entry first
    /// if there is none.
    pub fn upsert(&mut self, key: CacheKey, patch: EntryPatch<T>) -> &Entry<T> {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with_key(|key| Entry::new(key.clone()));
        entry.apply(patch);
        entry
    }

    /// Removes the entry for `key`, returning it if there was one.
    ///
    /// # Errors
    ///
    /// Entries that still have subscribers can not be evicted, and return
    /// [`CacheError::EntryInUse`].
    pub fn evict(&mut self, key: &CacheKey) -> Result<Option<Entry<T>>, CacheError> {
        match self.entries.get(key) {
            Some(entry) if entry.subscriber_count > 0 => Err(CacheError::EntryInUse {
                subscribers: entry.subscriber_count,
            }),
            _ => Ok(self.entries.remove(key)),
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
