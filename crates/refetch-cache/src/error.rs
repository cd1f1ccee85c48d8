use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource.
///
/// These errors are stored on the [`Entry`](crate::Entry) of the failed key and are handed to
/// subscribers. They are never returned from [`QueryCache::request`](crate::QueryCache::request)
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The resource does not exist at the remote end.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote end's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The fetch did not complete within the configured timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch failed due to another problem, like connection loss or an unsuccessful response.
    #[error("fetch failed: {0}")]
    Failed(String),
    /// The resource was fetched, but could not be parsed.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error, including a panic inside the fetch future.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for FetchError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl FetchError {
    /// Logs an unexpected error and turns it into [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the error kind, used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Timeout(_) => "timeout",
            Self::Failed(_) => "failed",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internal",
        }
    }
}

/// An error returned synchronously from the [`QueryCache`](crate::QueryCache) API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The request descriptor can not be encoded into a [`CacheKey`](crate::CacheKey).
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    /// The entry still has active subscribers and can not be evicted.
    #[error("entry is in use by {subscribers} subscribers")]
    EntryInUse {
        /// The number of active subscribers.
        subscribers: usize,
    },
    /// The cache has been disposed.
    #[error("cache has been disposed")]
    Disposed,
}
