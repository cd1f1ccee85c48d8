use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, RequestOptions};
use crate::entry::{Entry, EntryPatch, EntryStore, Status};
use crate::error::{CacheError, FetchError};
use crate::key::CacheKey;
use crate::policy::{self, Access};
use crate::subscriptions::{
    Callback, Notification, SubscriberId, Subscription, SubscriptionRegistry,
};
use crate::utils::CallOnDrop;

/// Fetches the value of a single key.
///
/// Every invocation receives a [`CancellationToken`] which is cancelled once a newer fetch of the
/// same key supersedes this one (see [`RequestOptions::cancel_on_supersede`]). Honoring it is
/// optional: results of superseded fetches are discarded either way.
///
/// This is implemented for all closures of the form
/// `Fn(CancellationToken) -> impl Future<Output = Result<T, FetchError>>`.
pub trait Fetcher<T>: Send + Sync + 'static {
    /// Starts a new fetch.
    fn fetch(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<T, FetchError>>;
}

impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    fn fetch(&self, cancel: CancellationToken) -> BoxFuture<'static, Result<T, FetchError>> {
        Box::pin((self)(cancel))
    }
}

/// A fetch that is currently running, or waiting to be retried.
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    task: AbortHandle,
}

/// A pending eviction timer.
struct Eviction {
    epoch: u64,
    task: AbortHandle,
}

/// Per-key bookkeeping of the coordinator, next to the [`Entry`] itself.
struct Query<T> {
    /// The most recently requested fetcher, used for refetches and revalidation.
    fetcher: Option<Arc<dyn Fetcher<T>>>,
    /// The most recently requested options.
    options: RequestOptions,
    in_flight: Option<InFlight>,
    eviction: Option<Eviction>,
}

impl<T> Query<T> {
    fn new(options: RequestOptions) -> Self {
        Self {
            fetcher: None,
            options,
            in_flight: None,
            eviction: None,
        }
    }

    fn abort(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            in_flight.task.abort();
        }
        if let Some(eviction) = self.eviction.take() {
            eviction.task.abort();
        }
    }
}

/// Values removed from the state while it is locked.
///
/// Callbacks, fetchers and values may own [`Subscription`]s whose drop locks the state again, so
/// these are only dropped once the lock is released.
type Released = Vec<Box<dyn Send>>;

struct State<T> {
    entries: EntryStore<T>,
    queries: HashMap<CacheKey, Query<T>>,
    subscriptions: SubscriptionRegistry<T>,
    /// Notifications in the order of the transitions that produced them.
    outbox: VecDeque<Notification<T>>,
    /// Whether some thread is currently draining the `outbox`.
    delivering: bool,
    /// The last generation that was handed out.
    ///
    /// This is shared by all keys, which makes generations unique even across evictions.
    generation: u64,
    eviction_epoch: u64,
    disposed: bool,
}

impl<T> State<T> {
    fn check_alive(&self) -> Result<(), CacheError> {
        match self.disposed {
            true => Err(CacheError::Disposed),
            false => Ok(()),
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn classify(&self, key: &CacheKey) -> Access {
        let (Some(entry), Some(query)) = (self.entries.get(key), self.queries.get(key)) else {
            return Access::Fetch;
        };
        let in_flight = query.in_flight.as_ref().map(|f| f.generation);
        policy::classify(entry, in_flight, query.options.stale_time)
    }

    /// Whether `generation` is still the latest fetch of `key`.
    fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        let in_flight = self
            .queries
            .get(key)
            .and_then(|query| query.in_flight.as_ref())
            .map(|in_flight| in_flight.generation);
        let latest = self.entries.get(key).map(Entry::generation);

        in_flight == Some(generation) && latest == Some(generation)
    }

    /// Queues a notification of the current state of `key` for all of its subscribers.
    fn notify(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get(key) {
            let notification = self.subscriptions.notification(entry);
            self.outbox.push_back(notification);
        }
    }

    fn abort_all(&mut self) {
        for query in self.queries.values_mut() {
            query.abort();
        }
    }
}

pub(crate) struct Inner<T> {
    config: CacheConfig,
    state: Mutex<State<T>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Fetch only if there is no fresh value and no fetch in flight.
    Request,
    /// Always start a new generation, superseding any fetch in flight.
    Refetch,
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Delivers all queued notifications, unless another thread is already doing so.
    ///
    /// Has to be called without holding the state lock. The outbox is drained in order by a
    /// single thread at a time, so every subscriber observes the transitions of a key in the
    /// order they happened. Notifications queued by callbacks are delivered by the same loop.
    fn flush(&self) {
        {
            let mut state = self.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }

        loop {
            let next = {
                let mut state = self.lock();
                let next = state.outbox.pop_front();
                if next.is_none() {
                    state.delivering = false;
                }
                next
            };
            match next {
                Some(notification) => notification.deliver(),
                None => break,
            }
        }
    }

    fn start(
        self: &Arc<Self>,
        key: CacheKey,
        fetcher: Arc<dyn Fetcher<T>>,
        options: RequestOptions,
        mode: Mode,
    ) -> Result<(), CacheError> {
        let name = self.name();
        metric!(counter("cache.access") += 1, "cache" => name);

        let _previous = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.check_alive()?;

            state.entries.upsert(key.clone(), EntryPatch::new());
            let query = state
                .queries
                .entry(key.clone())
                .or_insert_with(|| Query::new(options));
            let previous = query.fetcher.replace(fetcher);
            query.options = options;

            let access = match mode {
                Mode::Request => state.classify(&key),
                Mode::Refetch => Access::Fetch,
            };
            match access {
                Access::Attach => {
                    metric!(counter("cache.dedup") += 1, "cache" => name);
                    tracing::trace!(cache = name, %key, "attaching to in-flight fetch");
                }
                Access::Fresh => {
                    metric!(counter("cache.hit") += 1, "cache" => name);
                }
                Access::Terminal => {
                    tracing::trace!(cache = name, %key, "entry failed permanently");
                }
                Access::Fetch => {
                    self.begin_fetch(state, &key);
                }
            }

            self.ensure_eviction(state, &key);
            previous
        };
        self.flush();
        Ok(())
    }

    /// Starts a new generation for `key`, superseding any fetch in flight.
    ///
    /// Does nothing if no fetcher is known for `key`.
    fn begin_fetch(self: &Arc<Self>, state: &mut State<T>, key: &CacheKey) {
        let name = self.name();
        let Some(query) = state.queries.get_mut(key) else {
            return;
        };
        let Some(fetcher) = query.fetcher.clone() else {
            return;
        };
        let options = query.options;
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = query.in_flight.take() {
            metric!(counter("cache.fetch.superseded") += 1, "cache" => name);
            tracing::debug!(
                cache = name,
                %key,
                superseded = previous.generation,
                generation,
                "superseding in-flight fetch"
            );
            if options.cancel_on_supersede {
                previous.cancel.cancel();
            }
        }

        let cancel = CancellationToken::new();
        let task = {
            let cache = Arc::downgrade(self);
            let task = Self::drive(
                cache,
                key.clone(),
                generation,
                fetcher,
                options,
                cancel.clone(),
            );
            tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current()))).abort_handle()
        };
        query.in_flight = Some(InFlight {
            generation,
            cancel,
            task,
        });

        metric!(counter("cache.fetch") += 1, "cache" => name);
        tracing::debug!(cache = name, %key, generation, "starting fetch");

        state.entries.upsert(
            key.clone(),
            EntryPatch::new()
                .status(Status::Loading)
                .generation(generation)
                .failure_count(0)
                .clear_error()
                .invalidated(false),
        );
        state.notify(key);
    }

    /// Runs all attempts of one generation of `key`.
    async fn drive(
        cache: Weak<Self>,
        key: CacheKey,
        generation: u64,
        fetcher: Arc<dyn Fetcher<T>>,
        options: RequestOptions,
        cancel: CancellationToken,
    ) {
        loop {
            let started = Instant::now();
            let result = run_attempt(fetcher.as_ref(), cancel.clone(), options.timeout).await;

            let Some(inner) = cache.upgrade() else {
                return;
            };
            metric!(
                timer("cache.fetch.duration") = started.elapsed(),
                "cache" => inner.name(),
                "status" => if result.is_ok() { "ok" } else { "error" },
            );
            let Some(delay) = inner.settle(&key, generation, result, &options) else {
                return;
            };
            drop(inner);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }

            let Some(inner) = cache.upgrade() else {
                return;
            };
            if !inner.resume(&key, generation) {
                return;
            }
        }
    }

    /// Applies the result of a fetch attempt, if `generation` is still current.
    ///
    /// Returns the delay after which the fetch should be retried.
    fn settle(
        self: &Arc<Self>,
        key: &CacheKey,
        generation: u64,
        result: Result<T, FetchError>,
        options: &RequestOptions,
    ) -> Option<Duration> {
        let name = self.name();
        let (retry, _released) = {
            let mut guard = self.lock();
            let state = &mut *guard;

            if !state.is_current(key, generation) {
                metric!(counter("cache.fetch.stale_discard") += 1, "cache" => name);
                tracing::trace!(cache = name, %key, generation, "discarding stale fetch result");
                return None;
            }

            let (patch, retry) = match result {
                Ok(value) => {
                    tracing::debug!(cache = name, %key, generation, "fetch succeeded");
                    let patch = EntryPatch::new()
                        .status(Status::Success)
                        .value(Arc::new(value))
                        .clear_error()
                        .failure_count(0)
                        .last_updated(Instant::now());
                    (patch, None)
                }
                Err(error) => {
                    let failure_count = state.entries.get(key).map_or(0, Entry::failure_count) + 1;
                    let retry = policy::retry_delay(options, failure_count);

                    metric!(
                        counter("cache.fetch.error") += 1,
                        "cache" => name,
                        "error" => error.metrics_tag(),
                    );
                    match retry {
                        Some(delay) => tracing::debug!(
                            cache = name,
                            %key,
                            generation,
                            failure_count,
                            error = %error,
                            "fetch failed, retrying in {delay:?}"
                        ),
                        None => tracing::warn!(
                            cache = name,
                            %key,
                            generation,
                            failure_count,
                            error = %error,
                            "fetch failed permanently"
                        ),
                    }

                    let patch = EntryPatch::new()
                        .status(Status::Error)
                        .error(error)
                        .failure_count(failure_count);
                    (patch, retry)
                }
            };

            if retry.is_none() {
                if let Some(query) = state.queries.get_mut(key) {
                    query.in_flight = None;
                }
            }
            // the replaced value is released with the lock
            let released = state.entries.get(key).and_then(|entry| entry.value().cloned());
            state.entries.upsert(key.clone(), patch);
            state.notify(key);

            if retry.is_none() {
                self.ensure_eviction(state, key);
            }
            (retry, released)
        };

        self.flush();
        retry
    }

    /// Moves a failed entry back to `Loading` before the next attempt.
    ///
    /// Returns `false` if the generation has been superseded in the meantime.
    fn resume(&self, key: &CacheKey, generation: u64) -> bool {
        let name = self.name();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if !state.is_current(key, generation) {
                return false;
            }

            metric!(counter("cache.fetch.retry") += 1, "cache" => name);
            tracing::debug!(cache = name, %key, generation, "retrying fetch");

            state
                .entries
                .upsert(key.clone(), EntryPatch::new().status(Status::Loading));
            state.notify(key);
        }

        self.flush();
        true
    }

    fn subscribe(
        self: &Arc<Self>,
        key: CacheKey,
        callback: Callback<T>,
    ) -> Result<Subscription, CacheError> {
        let name = self.name();
        let id = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.check_alive()?;

            let existed = state.entries.contains(&key);
            let (id, count) = state
                .subscriptions
                .register(key.clone(), Arc::clone(&callback));
            let entry = state
                .entries
                .upsert(key.clone(), EntryPatch::new().subscriber_count(count));
            if existed {
                let initial = Notification::new(entry.clone(), vec![Arc::clone(&callback)]);
                state.outbox.push_back(initial);
            }

            let query = state
                .queries
                .entry(key.clone())
                .or_insert_with(|| Query::new(self.config.defaults));
            if let Some(eviction) = query.eviction.take() {
                eviction.task.abort();
            }

            if query.fetcher.is_some() && state.classify(&key) == Access::Fetch {
                tracing::debug!(cache = name, %key, "revalidating stale entry");
                self.begin_fetch(state, &key);
            }

            id
        };
        self.flush();

        let detach = {
            let cache = Arc::downgrade(self);
            let key = key.clone();
            CallOnDrop::new(move || {
                if let Some(inner) = cache.upgrade() {
                    inner.detach(&key, id);
                }
            })
        };
        Ok(Subscription::new(key, detach))
    }

    fn detach(self: &Arc<Self>, key: &CacheKey, id: SubscriberId) {
        let _callback = {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some((callback, remaining)) = state.subscriptions.unregister(key, id) else {
                return;
            };
            if state.entries.contains(key) {
                state
                    .entries
                    .upsert(key.clone(), EntryPatch::new().subscriber_count(remaining));
            }
            if remaining == 0 {
                tracing::trace!(cache = self.name(), %key, "last subscriber detached");
                self.schedule_eviction(state, key);
            }
            callback
        };
    }

    fn invalidate(self: &Arc<Self>, key: &CacheKey) -> Result<(), CacheError> {
        let name = self.name();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.check_alive()?;

            if !state.entries.contains(key) {
                return Ok(());
            }
            metric!(counter("cache.invalidate") += 1, "cache" => name);

            let entry = state
                .entries
                .upsert(key.clone(), EntryPatch::new().invalidated(true));
            let is_observed = entry.subscriber_count() > 0;
            let refetch = state.queries.get(key).is_some_and(|query| {
                query.fetcher.is_some() && (query.in_flight.is_some() || is_observed)
            });

            tracing::debug!(cache = name, %key, refetch, "invalidating entry");
            if refetch {
                self.begin_fetch(state, key);
            }
        }

        self.flush();
        Ok(())
    }

    fn set_value(self: &Arc<Self>, key: CacheKey, value: T) -> Result<(), CacheError> {
        let name = self.name();
        let _released = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.check_alive()?;

            let generation = state.next_generation();
            let query = state
                .queries
                .entry(key.clone())
                .or_insert_with(|| Query::new(self.config.defaults));
            if let Some(previous) = query.in_flight.take() {
                metric!(counter("cache.fetch.superseded") += 1, "cache" => name);
                if query.options.cancel_on_supersede {
                    previous.cancel.cancel();
                }
            }

            tracing::debug!(cache = name, %key, generation, "setting value");
            let released = state.entries.get(&key).and_then(|entry| entry.value().cloned());
            state.entries.upsert(
                key.clone(),
                EntryPatch::new()
                    .status(Status::Success)
                    .value(Arc::new(value))
                    .clear_error()
                    .generation(generation)
                    .failure_count(0)
                    .last_updated(Instant::now())
                    .invalidated(false),
            );
            state.notify(&key);

            self.ensure_eviction(state, &key);
            released
        };

        self.flush();
        Ok(())
    }

    fn evict(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let name = self.name();
        let mut released = Released::new();
        let evicted = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.check_alive()?;

            let evicted = state.entries.evict(key)?;
            if let Some(mut query) = state.queries.remove(key) {
                query.abort();
                released.push(Box::new(query.fetcher));
            }
            match evicted {
                Some(entry) => {
                    metric!(counter("cache.eviction") += 1, "cache" => name);
                    tracing::debug!(cache = name, %key, "evicted entry");
                    released.push(Box::new(entry.value().cloned()));
                    true
                }
                None => false,
            }
        };

        drop(released);
        Ok(evicted)
    }

    /// Arms the eviction timer of `key` if it has no subscribers and no timer is armed yet.
    fn ensure_eviction(self: &Arc<Self>, state: &mut State<T>, key: &CacheKey) {
        let is_unused = state.subscriptions.count(key) == 0;
        let is_armed = state
            .queries
            .get(key)
            .is_some_and(|query| query.eviction.is_some());
        if is_unused && !is_armed {
            self.schedule_eviction(state, key);
        }
    }

    /// (Re-)arms the eviction timer of `key`.
    fn schedule_eviction(self: &Arc<Self>, state: &mut State<T>, key: &CacheKey) {
        state.eviction_epoch += 1;
        let epoch = state.eviction_epoch;
        let Some(query) = state.queries.get_mut(key) else {
            return;
        };
        if let Some(previous) = query.eviction.take() {
            previous.task.abort();
        }

        let gc_time = self.config.gc_time;
        let cache = Arc::downgrade(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(inner) = cache.upgrade() {
                inner.collect(&task_key, epoch);
            }
        });
        query.eviction = Some(Eviction {
            epoch,
            task: task.abort_handle(),
        });
    }

    /// Evicts `key` once its eviction timer with the given `epoch` fired.
    fn collect(&self, key: &CacheKey, epoch: u64) {
        let name = self.name();
        let mut released = Released::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;

            let Some(query) = state.queries.get_mut(key) else {
                return;
            };
            if query.eviction.as_ref().map(|eviction| eviction.epoch) != Some(epoch) {
                return;
            }
            query.eviction = None;
            if query.in_flight.is_some() {
                // re-armed once the fetch settles
                return;
            }

            match state.entries.evict(key) {
                Ok(entry) => {
                    if let Some(query) = state.queries.remove(key) {
                        released.push(Box::new(query.fetcher));
                    }
                    released.push(Box::new(entry.and_then(|entry| entry.value().cloned())));
                    metric!(counter("cache.eviction") += 1, "cache" => name);
                    tracing::debug!(cache = name, %key, "evicted unused entry");
                }
                Err(err) => {
                    tracing::trace!(cache = name, %key, error = %err, "not evicting entry");
                }
            }
        }

        drop(released);
    }

    fn dispose(&self) {
        let released = {
            let mut state = self.lock();
            state.disposed = true;
            state.abort_all();
            (
                mem::take(&mut state.queries),
                mem::take(&mut state.entries),
                mem::take(&mut state.subscriptions),
                mem::take(&mut state.outbox),
            )
        };

        drop(released);
        tracing::debug!(cache = self.name(), "disposed cache");
    }
}

/// Runs a single fetch attempt, turning timeouts and panics into [`FetchError`]s.
async fn run_attempt<T: 'static>(
    fetcher: &dyn Fetcher<T>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Result<T, FetchError> {
    let fetch = AssertUnwindSafe(fetcher.fetch(cancel)).catch_unwind();
    let result = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_elapsed) => return Err(FetchError::Timeout(timeout)),
        },
        None => fetch.await,
    };

    result.unwrap_or_else(|_panic| {
        tracing::error!("fetch panicked");
        Err(FetchError::InternalError)
    })
}

/// An in-memory cache of asynchronously fetched resources.
///
/// The cache coalesces concurrent requests for the same key into a single fetch, and makes sure
/// that only the result of the most recently started fetch of a key is ever stored, regardless
/// of the order in which fetches complete. Subscribers are notified on every state transition of
/// the keys they observe.
///
/// Keys are derived from arbitrary [`Serialize`]-able descriptors, see [`CacheKey`].
///
/// All fetches are spawned on the current [`tokio`] runtime, so the methods of this type that may
/// start a fetch have to be called from within a runtime.
///
/// The cache is a cheap handle, clones refer to the same underlying cache.
pub struct QueryCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        let in_flight = state
            .queries
            .values()
            .filter(|query| query.in_flight.is_some())
            .count();
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("entries", &state.entries.len())
            .field("in_flight", &in_flight)
            .field("subscriptions", &state.subscriptions)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<T: Send + Sync + 'static> QueryCache<T> {
    /// Creates a new, empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let state = State {
            entries: EntryStore::new(),
            queries: HashMap::new(),
            subscriptions: SubscriptionRegistry::default(),
            outbox: VecDeque::new(),
            delivering: false,
            generation: 0,
            eviction_epoch: 0,
            disposed: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Requests the resource identified by `descriptor` with the default [`RequestOptions`].
    ///
    /// See [`request_with`](Self::request_with).
    pub fn request<D, F>(&self, descriptor: &D, fetcher: F) -> Result<(), CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<T>,
    {
        self.request_with(descriptor, fetcher, self.inner.config.defaults)
    }

    /// Requests the resource identified by `descriptor`.
    ///
    /// - If a fetch of the key is already in flight, or waiting to be retried, the request is
    ///   attached to it and `fetcher` is not invoked.
    /// - If the entry holds a value that is not yet stale, nothing is fetched.
    /// - If the entry failed permanently, nothing is fetched until it is
    ///   [invalidated](Self::invalidate).
    /// - Otherwise a new fetch is started in the background.
    ///
    /// `fetcher` and `options` are remembered for the key, and are used for later revalidation.
    /// The outcome of the fetch is observable through [`subscribe`](Self::subscribe) and
    /// [`get_snapshot`](Self::get_snapshot). Fetch errors are never returned from here.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidDescriptor`] if no key can be built from `descriptor`.
    pub fn request_with<D, F>(
        &self,
        descriptor: &D,
        fetcher: F,
        options: RequestOptions,
    ) -> Result<(), CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<T>,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner
            .start(key, Arc::new(fetcher), options, Mode::Request)
    }

    /// Starts a new fetch of `descriptor`, superseding any fetch in flight.
    ///
    /// The result of a superseded fetch is discarded, even if it completes last.
    pub fn refetch<D, F>(
        &self,
        descriptor: &D,
        fetcher: F,
        options: RequestOptions,
    ) -> Result<(), CacheError>
    where
        D: Serialize + ?Sized,
        F: Fetcher<T>,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner
            .start(key, Arc::new(fetcher), options, Mode::Refetch)
    }

    /// Observes the entry of `descriptor`.
    ///
    /// If the entry already exists, `callback` is invoked right away with its current state, and
    /// afterwards on every state transition, until the returned [`Subscription`] is dropped.
    /// A stale entry is revalidated in the background, while its value is still being served.
    pub fn subscribe<D, F>(&self, descriptor: &D, callback: F) -> Result<Subscription, CacheError>
    where
        D: Serialize + ?Sized,
        F: Fn(&Entry<T>) + Send + Sync + 'static,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner.subscribe(key, Arc::new(callback))
    }

    /// Marks the entry of `descriptor` as invalid, forcing the next access to refetch it.
    ///
    /// Entries with subscribers or a fetch in flight are refetched right away. This also
    /// revives entries that failed permanently.
    pub fn invalidate<D>(&self, descriptor: &D) -> Result<(), CacheError>
    where
        D: Serialize + ?Sized,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner.invalidate(&key)
    }

    /// Returns a snapshot of the current entry of `descriptor`.
    pub fn get_snapshot<D>(&self, descriptor: &D) -> Result<Option<Entry<T>>, CacheError>
    where
        D: Serialize + ?Sized,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        let state = self.inner.lock();
        state.check_alive()?;
        Ok(state.entries.get(&key).cloned())
    }

    /// Stores `value` for `descriptor` directly, superseding any fetch in flight.
    pub fn set_value<D>(&self, descriptor: &D, value: T) -> Result<(), CacheError>
    where
        D: Serialize + ?Sized,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner.set_value(key, value)
    }

    /// Removes the entry of `descriptor` right away, returning whether there was one.
    ///
    /// # Errors
    ///
    /// Entries with subscribers can not be evicted, and return [`CacheError::EntryInUse`].
    pub fn evict<D>(&self, descriptor: &D) -> Result<bool, CacheError>
    where
        D: Serialize + ?Sized,
    {
        let key = CacheKey::from_descriptor(descriptor)?;
        self.inner.evict(&key)
    }

    /// The number of entries in the cache.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts all fetches and timers and drops all entries and subscriptions.
    ///
    /// Every later call on this cache, or any of its clones, fails with [`CacheError::Disposed`].
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}
