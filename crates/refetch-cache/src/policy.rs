//! Decides when entries need to be (re)fetched, and how failed fetches are retried.

use std::time::Duration;

use crate::config::RequestOptions;
use crate::entry::{Entry, Status};

/// What to do when an entry is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// A fetch of the current generation is in flight, the access attaches to it.
    Attach,
    /// The entry holds a fresh value.
    Fresh,
    /// The entry failed and exhausted its retries. Only an invalidation will fetch it again.
    Terminal,
    /// A new fetch has to be started.
    Fetch,
}

/// Classifies an access to `entry`.
///
/// `in_flight` is the generation of the currently running fetch (or pending retry) of the key.
pub(crate) fn classify<T>(
    entry: &Entry<T>,
    in_flight: Option<u64>,
    stale_time: Duration,
) -> Access {
    if in_flight == Some(entry.generation()) {
        return Access::Attach;
    }
    if entry.is_invalidated() {
        return Access::Fetch;
    }
    match entry.status() {
        Status::Success if !entry.is_stale(stale_time) => Access::Fresh,
        Status::Error => Access::Terminal,
        _ => Access::Fetch,
    }
}

/// Returns the delay before retrying after the `failure_count`-th consecutive failure, or `None`
/// if no retries are left.
///
/// The delay starts at [`retry_delay`](RequestOptions::retry_delay) and doubles with every
/// failure, capped at [`max_retry_delay`](RequestOptions::max_retry_delay).
pub(crate) fn retry_delay(options: &RequestOptions, failure_count: u32) -> Option<Duration> {
    if failure_count == 0 || failure_count > options.retry {
        return None;
    }
    let factor = 2u32.saturating_pow(failure_count - 1);
    let delay = options.retry_delay.saturating_mul(factor);
    Some(delay.min(options.max_retry_delay))
}
