//! An in-memory cache for asynchronously fetched resources.
//!
//! The [`QueryCache`] keeps one [`Entry`] per [`CacheKey`] and coordinates the fetches that
//! populate them:
//!
//! - Concurrent requests for the same key are coalesced into a single fetch.
//! - Every fetch is tagged with a generation. Only the result of the latest generation of a key
//!   is ever stored, results of superseded fetches are discarded.
//! - Subscribers are notified on every state transition of the keys they observe. Entries
//!   without subscribers are evicted after a grace period.
//! - Failed fetches are retried with exponential backoff, and stale entries are revalidated in
//!   the background while their value keeps being served.
//!
//! ```ignore
//! let cache = QueryCache::new(CacheConfig::default());
//! let _subscription = cache.subscribe(&("user", 1), |entry: &Entry<User>| {
//!     println!("{:?}: {:?}", entry.status(), entry.value());
//! })?;
//! cache.request(&("user", 1), |_cancel| async { fetch_user(1).await })?;
//! ```

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod entry;
mod error;
mod key;
pub mod logging;
mod policy;
mod subscriptions;
mod utils;

pub use cache::{Fetcher, QueryCache};
pub use config::{CacheConfig, Config, RequestOptions};
pub use entry::{Entry, EntryPatch, EntryStore, Status};
pub use error::{CacheError, FetchError};
pub use key::CacheKey;
pub use subscriptions::{Callback, Subscription};
pub use tokio_util::sync::CancellationToken;
