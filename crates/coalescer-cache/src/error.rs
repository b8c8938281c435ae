use std::time::Duration;

use thiserror::Error;

/// An error returned by [`CoalescingCache::get_or_compute`](crate::CoalescingCache::get_or_compute).
///
/// Only [`Compute`](Self::Compute) is ever memoized. The other variants describe what happened to
/// one particular request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The compute function returned an error.
    ///
    /// This error is cached like a value and handed out to every caller until the entry expires or
    /// is deleted.
    #[error("computation failed: {0}")]
    Compute(E),
    /// The computation panicked, or the runtime shut down before it settled.
    ///
    /// Nothing is cached, so the next request starts a fresh computation.
    #[error("computation aborted")]
    Aborted,
    /// The caller stopped waiting for a computation started by someone else.
    #[error("gave up waiting for computation after {0:?}")]
    Timeout(Duration),
}

impl<E> CacheError<E> {
    /// Returns the computation error, if this is one.
    pub fn into_compute_error(self) -> Option<E> {
        match self {
            Self::Compute(err) => Some(err),
            _ => None,
        }
    }

    /// A short tag describing the error kind, used to tag the `cache.access.failed` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compute(_) => "compute",
            Self::Aborted => "aborted",
            Self::Timeout(_) => "timeout",
        }
    }
}
