//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most cache tests should run with paused time (`#[tokio::test(start_paused = true)]`), so
//!    that fetch delays, retry backoff and eviction timers complete instantly and in a
//!    deterministic order.
//!
//!  - A [`Recorder`] collects everything passed to its [`callback`](Recorder::callback). Hold on
//!    to the recorder for the entire test; once it is dropped, [`Recorder::next`] can no longer
//!    be awaited and callbacks silently discard their input.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// How long [`Recorder::next`] waits before giving up.
///
/// With paused time, this only elapses if a test is stuck.
const RECV_TIMEOUT: Duration = Duration::from_secs(3600);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refetch_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("refetch_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Records every value passed to its [`callback`](Self::callback), in order.
#[derive(Debug)]
pub struct Recorder<E> {
    tx: mpsc::UnboundedSender<E>,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Default for Recorder<E> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }
}

impl<E: Clone + Send + 'static> Recorder<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that records a clone of its argument.
    pub fn callback(&self) -> impl Fn(&E) + Send + Sync + 'static + use<E> {
        let tx = self.tx.clone();
        move |event: &E| {
            tx.send(event.clone()).ok();
        }
    }

    /// Waits for the next recorded value.
    ///
    /// Panics if nothing is recorded in time.
    pub async fn next(&mut self) -> E {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a recorded value")
            .expect("recorder channel closed")
    }

    /// Returns all values recorded so far, without waiting.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A shared counter, used to count and number fetcher invocations.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter, returning the value before the increment.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
