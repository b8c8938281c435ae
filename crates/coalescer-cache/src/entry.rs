use std::time::Duration;

use tokio::time::Instant;

/// When a [`CacheEntry`] stops being valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiration {
    /// The entry expires once the clock is strictly past this instant.
    At(Instant),
    /// The entry lives until it is explicitly overwritten or deleted.
    Never,
}

impl Expiration {
    /// Computes the expiration for an entry created at `now`.
    ///
    /// A missing or zero `ttl` means the entry never expires.
    pub fn from_ttl(now: Instant, ttl: Option<Duration>) -> Self {
        match ttl {
            Some(ttl) if !ttl.is_zero() => match now.checked_add(ttl) {
                Some(deadline) => Self::At(deadline),
                None => Self::Never,
            },
            _ => Self::Never,
        }
    }

    /// Whether an entry with this expiration is expired at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            Self::At(deadline) => now > *deadline,
            Self::Never => false,
        }
    }
}

/// A settled result held by the cache.
///
/// Entries are immutable. Overwriting a key replaces its entry as a whole.
#[derive(Clone, Debug)]
pub struct CacheEntry<V, E> {
    /// The computed value, or the memoized computation failure.
    pub contents: Result<V, E>,
    /// When this entry stops being served.
    pub expiration: Expiration,
}

impl<V, E> CacheEntry<V, E> {
    pub(crate) fn new(contents: Result<V, E>, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            contents,
            expiration: Expiration::from_ttl(now, ttl),
        }
    }

    /// Whether this entry is still served at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        !self.expiration.is_expired(now)
    }
}
