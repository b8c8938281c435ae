//! An in-memory cache for expensive computations.
//!
//! The [`CoalescingCache`] provides request coalescing and time-based expiry:
//!
//! - Concurrent requests for a key that is not cached yet are merged into a single invocation of
//!   the [`ComputeFunction`]. Every requester receives the result of that one invocation.
//! - Results, including computation errors, are kept until their TTL runs out or they are deleted.
//!   Expired entries are dropped lazily on access and, optionally, by a periodic sweep.
//!
//! Computations run on their own Tokio task, so cancelling a caller never cancels the computation
//! it waits on. A computation that panics never leaves its waiters hanging: they are released
//! with [`CacheError::Aborted`] and nothing is cached.
//!
//! Time is read from an injectable [`Clock`], which makes expiry fully deterministic in tests.

#[macro_use]
pub mod metrics;

mod cache;
pub mod clock;
mod compute;
pub mod config;
mod entry;
mod error;
pub mod logging;
mod slot;
mod sweeper;

pub use cache::{CacheBuilder, CacheResult, CoalescingCache, KeyState};
pub use clock::{Clock, ManualClock, TokioClock};
pub use compute::ComputeFunction;
pub use config::CacheConfig;
pub use entry::{CacheEntry, Expiration};
pub use error::CacheError;
