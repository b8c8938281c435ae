use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::clock::{Clock, TokioClock};
use crate::compute::ComputeFunction;
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::slot::{Delivery, Slot};
use crate::sweeper::{self, SweeperGuard};
use crate::CacheError;

/// The result handed out by [`CoalescingCache::get_or_compute`].
pub type CacheResult<K, F> =
    Result<<F as ComputeFunction<K>>::Value, CacheError<<F as ComputeFunction<K>>::Error>>;

/// The observable state of a single key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// Nothing is cached and nothing is being computed.
    Idle,
    /// A computation is running, with this many callers waiting on it.
    ///
    /// The caller that started the computation counts as a waiter as well. The computation keeps
    /// running when every waiter is gone.
    InProgress {
        /// The number of registered waiters.
        waiters: usize,
    },
    /// A live entry is cached.
    Settled,
}

struct State<K, V, E> {
    entries: HashMap<K, CacheEntry<V, E>>,
    slots: HashMap<K, Slot<V, E>>,
}

/// The outcome of the check-and-transition step of [`CoalescingCache::get_or_compute`].
enum Claim<V, E> {
    /// A live entry was found.
    Hit(Result<V, E>),
    /// Somebody else is computing; wait on this receiver.
    Wait {
        id: u64,
        receiver: oneshot::Receiver<Delivery<V, E>>,
    },
    /// A fresh slot was created with the caller as its first waiter, and the computation has to
    /// be started.
    Compute {
        id: u64,
        receiver: oneshot::Receiver<Delivery<V, E>>,
    },
}

pub(crate) struct Shared<K, F: ComputeFunction<K>, C> {
    name: String,
    compute: F,
    clock: C,
    waiter_timeout: Option<Duration>,
    next_waiter_id: AtomicU64,
    state: RwLock<State<K, F::Value, F::Error>>,
}

/// An in-memory cache that coalesces concurrent computations and expires results after a TTL.
///
/// Every key moves through `Idle → InProgress → Settled`, and back to `Idle` once its entry
/// expires or is deleted. The first caller to miss a key spawns the [`ComputeFunction`] onto the
/// Tokio runtime. It and every later caller for that key register as waiters and receive the very
/// same result. Both successful values and computation errors are memoized.
///
/// A spawned computation always runs to completion. Cancelling or timing out a caller, including
/// the one that started it, only removes that caller from the waiters.
///
/// A single lock guards all entries, in-progress slots, and their waiter lists. It is only held
/// for short map operations and never while the computation runs, so a slow computation for one
/// key never blocks any other key.
///
/// Cloning the cache is cheap and yields a handle to the same underlying state.
pub struct CoalescingCache<K, F: ComputeFunction<K>, C = TokioClock> {
    shared: Arc<Shared<K, F, C>>,
    /// Aborts the background sweeper once the last handle goes away.
    _sweeper: Option<Arc<SweeperGuard>>,
}

impl<K, F: ComputeFunction<K>, C> Clone for CoalescingCache<K, F, C> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            shared: Arc::clone(&self.shared),
            _sweeper: self._sweeper.clone(),
        }
    }
}

impl<K, F: ComputeFunction<K>, C> fmt::Debug for CoalescingCache<K, F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, computations) = self
            .shared
            .state
            .try_read()
            .map(|state| (state.entries.len(), state.slots.len()))
            .unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("name", &self.shared.name)
            .field("entries", &entries)
            .field("running computations", &computations)
            .field("waiter_timeout", &self.shared.waiter_timeout)
            .field("sweeper", &self._sweeper.is_some())
            .finish()
    }
}

/// Configures and constructs a [`CoalescingCache`].
pub struct CacheBuilder<K, F, C = TokioClock> {
    compute: F,
    clock: C,
    name: String,
    waiter_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    _key: PhantomData<fn(K)>,
}

impl<K, F> CacheBuilder<K, F, TokioClock> {
    /// Starts building a cache around `compute`.
    pub fn new(compute: F) -> Self {
        Self {
            compute,
            clock: TokioClock,
            name: "default".into(),
            waiter_timeout: None,
            sweep_interval: None,
            _key: PhantomData,
        }
    }
}

impl<K, F, C> CacheBuilder<K, F, C> {
    /// The name used to tag metrics and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Bounds how long callers wait on a computation started by somebody else.
    pub fn waiter_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.waiter_timeout = timeout;
        self
    }

    /// Periodically removes expired entries in a background task.
    ///
    /// The sweeper is only started when the cache is built within a Tokio runtime.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Replaces the time source used for expiration.
    pub fn clock<C2: Clock>(self, clock: C2) -> CacheBuilder<K, F, C2> {
        CacheBuilder {
            compute: self.compute,
            clock,
            name: self.name,
            waiter_timeout: self.waiter_timeout,
            sweep_interval: self.sweep_interval,
            _key: PhantomData,
        }
    }
}

impl<K, F, C> CacheBuilder<K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    /// Builds the cache.
    pub fn build(self) -> CoalescingCache<K, F, C> {
        let shared = Arc::new(Shared {
            name: self.name,
            compute: self.compute,
            clock: self.clock,
            waiter_timeout: self.waiter_timeout,
            next_waiter_id: AtomicU64::new(0),
            state: RwLock::new(State {
                entries: HashMap::new(),
                slots: HashMap::new(),
            }),
        });

        let sweeper = self
            .sweep_interval
            .and_then(|interval| sweeper::spawn(&shared, interval))
            .map(Arc::new);

        CoalescingCache {
            shared,
            _sweeper: sweeper,
        }
    }
}

impl<K, F> CoalescingCache<K, F, TokioClock>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
{
    /// Creates a cache with default settings.
    pub fn new(compute: F) -> Self {
        CacheBuilder::new(compute).build()
    }

    /// Creates a cache from its configuration section.
    pub fn from_config(config: &CacheConfig, compute: F) -> Self {
        CacheBuilder::new(compute)
            .name(config.name.clone())
            .waiter_timeout(config.waiter_timeout)
            .sweep_interval(config.sweep_interval)
            .build()
    }

    /// Starts building a customized cache.
    pub fn builder(compute: F) -> CacheBuilder<K, F, TokioClock> {
        CacheBuilder::new(compute)
    }
}

impl<K, F, C> CoalescingCache<K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    /// The name of this cache, as used in metrics and logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the cached contents for `key`, if a live entry exists.
    ///
    /// This never triggers a computation. A memoized computation failure is returned as
    /// `Some(Err(_))`.
    pub fn get(&self, key: &K) -> Option<Result<F::Value, F::Error>> {
        self.shared
            .with_live_entry(key, |entry| entry.contents.clone())
    }

    /// Returns the cached result for `key`, computing it if needed.
    ///
    /// Concurrent calls for the same missing key are coalesced: only the first one spawns the
    /// [`ComputeFunction`], and all of them wait for its result. The result, including a
    /// computation error, is cached for `ttl`, or forever if `ttl` is `None` or zero.
    ///
    /// Waiting is bounded by the configured waiter timeout, if any. The computation itself is
    /// never timed out and keeps running when its callers give up.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Compute`] if the computation failed, now or in a previous, still cached run.
    /// - [`CacheError::Aborted`] if the computation panicked.
    /// - [`CacheError::Timeout`] if this caller gave up waiting.
    ///
    /// # Panics
    ///
    /// Starting a computation panics when called outside of a Tokio runtime.
    pub async fn get_or_compute(&self, key: K, ttl: Option<Duration>) -> CacheResult<K, F> {
        self.shared
            .get_or_compute(key, ttl, self.shared.waiter_timeout)
            .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but waits at most `timeout` on a
    /// computation started by somebody else.
    pub async fn get_or_compute_timeout(
        &self,
        key: K,
        ttl: Option<Duration>,
        timeout: Duration,
    ) -> CacheResult<K, F> {
        self.shared.get_or_compute(key, ttl, Some(timeout)).await
    }

    /// Unconditionally caches `value` for `key`.
    ///
    /// This replaces any existing entry. A computation for `key` that is already running is not
    /// affected and will overwrite this entry once it settles.
    pub fn set(&self, key: K, value: F::Value, ttl: Option<Duration>) {
        let entry = CacheEntry::new(Ok(value), self.shared.clock.now(), ttl);
        self.shared.write().entries.insert(key, entry);
    }

    /// Removes the entry for `key`.
    ///
    /// If a computation for `key` is running, its result is still handed to its waiters, but it
    /// will not be cached. Returns whether an entry was removed, expired or not, or a running
    /// computation was invalidated.
    pub fn delete(&self, key: &K) -> bool {
        let mut state = self.shared.write();

        let removed = state.entries.remove(key).is_some();
        let invalidated = state
            .slots
            .get_mut(key)
            .is_some_and(|slot| slot.invalidate());

        tracing::trace!(cache = %self.shared.name, removed, invalidated, "deleted cache key");
        removed || invalidated
    }

    /// Whether a live entry exists for `key`.
    pub fn exists(&self, key: &K) -> bool {
        self.shared.with_live_entry(key, |_| ()).is_some()
    }

    /// The number of live entries.
    ///
    /// Expired entries that have not been removed yet, and running computations, are not counted.
    pub fn size(&self) -> usize {
        let now = self.shared.clock.now();
        let state = self.shared.read();
        state
            .entries
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Returns the current state of `key`.
    pub fn state(&self, key: &K) -> KeyState {
        let now = self.shared.clock.now();
        let state = self.shared.read();
        if state.entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            KeyState::Settled
        } else if let Some(slot) = state.slots.get(key) {
            KeyState::InProgress {
                waiters: slot.waiter_count(),
            }
        } else {
            KeyState::Idle
        }
    }

    /// Removes all expired entries, returning how many were removed.
    ///
    /// Running computations are never touched.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }
}

impl<K, F, C> Shared<K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, State<K, F::Value, F::Error>> {
        // No user code ever runs while the lock is held, so a poisoned lock is still consistent.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<K, F::Value, F::Error>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_live_entry<R>(
        &self,
        key: &K,
        f: impl FnOnce(&CacheEntry<F::Value, F::Error>) -> R,
    ) -> Option<R> {
        let now = self.clock.now();
        let state = self.read();
        state
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(f)
    }

    async fn get_or_compute(
        self: &Arc<Self>,
        key: K,
        ttl: Option<Duration>,
        timeout: Option<Duration>,
    ) -> CacheResult<K, F> {
        metric!(counter("cache.access") += 1, "cache" => &self.name);

        let result = self.resolve(key, ttl, timeout).await;
        if let Err(error) = &result {
            metric!(
                counter("cache.access.failed") += 1,
                "cache" => &self.name,
                "error" => error.kind(),
            );
        }
        result
    }

    async fn resolve(
        self: &Arc<Self>,
        key: K,
        ttl: Option<Duration>,
        timeout: Option<Duration>,
    ) -> CacheResult<K, F> {
        if let Some(contents) = self.with_live_entry(&key, |entry| entry.contents.clone()) {
            metric!(counter("cache.memory.hit") += 1, "cache" => &self.name);
            return contents.map_err(CacheError::Compute);
        }

        match self.claim(&key) {
            Claim::Hit(contents) => {
                metric!(counter("cache.memory.hit") += 1, "cache" => &self.name);
                contents.map_err(CacheError::Compute)
            }
            Claim::Wait { id, receiver } => {
                metric!(counter("cache.waiter.joined") += 1, "cache" => &self.name);
                tracing::trace!(cache = %self.name, waiter = id, "joining running computation");
                self.wait(key, id, receiver, timeout).await
            }
            Claim::Compute { id, receiver } => {
                self.spawn_computation(key.clone(), ttl);
                self.wait(key, id, receiver, timeout).await
            }
        }
    }

    /// Decides, in one critical section, whether `key` is cached, being computed, or needs a new
    /// computation. The caller is registered as a waiter in the latter two cases.
    fn claim(&self, key: &K) -> Claim<F::Value, F::Error> {
        let now = self.clock.now();
        let mut state = self.write();

        let live = state.entries.get(key).map(|entry| entry.is_live(now));
        match live {
            Some(true) => {
                if let Some(entry) = state.entries.get(key) {
                    return Claim::Hit(entry.contents.clone());
                }
            }
            Some(false) => {
                state.entries.remove(key);
                metric!(counter("cache.memory.expired") += 1, "cache" => &self.name);
            }
            None => {}
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = state.slots.get_mut(key) {
            let receiver = slot.register(id);
            return Claim::Wait { id, receiver };
        }

        let mut slot = Slot::new();
        let receiver = slot.register(id);
        state.slots.insert(key.clone(), slot);
        Claim::Compute { id, receiver }
    }

    async fn wait(
        &self,
        key: K,
        id: u64,
        receiver: oneshot::Receiver<Delivery<F::Value, F::Error>>,
        timeout: Option<Duration>,
    ) -> CacheResult<K, F> {
        let mut registration = Registration {
            shared: self,
            key,
            id,
            active: true,
        };

        let delivery = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(delivery) => delivery,
                Err(_) => {
                    tracing::debug!(
                        cache = %self.name,
                        waiter = id,
                        "gave up waiting after {:?}",
                        timeout
                    );
                    // dropping `registration` removes us from the slot
                    return Err(CacheError::Timeout(timeout));
                }
            },
            None => receiver.await,
        };
        registration.active = false;

        // The sender is only ever dropped without sending when we deregistered ourselves.
        delivery.unwrap_or(Err(CacheError::Aborted))
    }

    /// Spawns the computation for a freshly claimed slot onto the runtime.
    ///
    /// The spawned task settles the slot itself, so the computation outlives every caller that is
    /// waiting on it, including the one that claimed the slot.
    fn spawn_computation(self: &Arc<Self>, key: K, ttl: Option<Duration>) {
        metric!(counter("cache.computation") += 1, "cache" => &self.name);
        tracing::trace!(cache = %self.name, "spawning computation");

        let episode = Episode {
            shared: Arc::clone(self),
            key,
            settled: false,
        };

        tokio::spawn(async move {
            let shared = Arc::clone(&episode.shared);
            let key = episode.key.clone();

            let started = std::time::Instant::now();
            let computation = async { shared.compute.compute(key).await };
            let result = AssertUnwindSafe(computation).catch_unwind().await;
            metric!(timer("cache.computation.duration") = started.elapsed(), "cache" => &shared.name);

            match result {
                Ok(contents) => {
                    if contents.is_err() {
                        metric!(counter("cache.computation.failed") += 1, "cache" => &shared.name);
                    }
                    episode.settle(contents, ttl);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                        .unwrap_or("<unknown>");
                    tracing::error!(cache = %shared.name, panic = message, "computation panicked");
                    // dropping the unsettled episode releases the waiters
                    drop(episode);
                }
            }
        });
    }

    /// Installs the result of a finished computation and releases its waiters.
    fn settle(&self, key: &K, contents: Result<F::Value, F::Error>, ttl: Option<Duration>) {
        let now = self.clock.now();
        let mut state = self.write();

        debug_assert!(
            state.slots.contains_key(key),
            "settled a computation without a running slot"
        );
        let Some(slot) = state.slots.remove(key) else {
            tracing::error!(cache = %self.name, "settled a computation without a running slot");
            return;
        };

        let cached = !slot.is_invalidated();
        if cached {
            let entry = CacheEntry::new(contents.clone(), now, ttl);
            state.entries.insert(key.clone(), entry);
        }
        let released = slot.release(contents.map_err(CacheError::Compute));

        tracing::debug!(cache = %self.name, cached, released, "computation settled");
    }

    /// Tears down a slot whose computation will never settle.
    fn abort(&self, key: &K) {
        let Some(slot) = self.write().slots.remove(key) else {
            tracing::error!(cache = %self.name, "aborted a computation without a running slot");
            return;
        };
        let released = slot.release(Err(CacheError::Aborted));

        metric!(counter("cache.computation.aborted") += 1, "cache" => &self.name);
        tracing::debug!(cache = %self.name, released, "computation aborted");
    }

    fn deregister(&self, key: &K, id: u64) {
        let mut state = self.write();
        let removed = state
            .slots
            .get_mut(key)
            .is_some_and(|slot| slot.deregister(id));
        drop(state);

        if removed {
            metric!(counter("cache.waiter.cancelled") += 1, "cache" => &self.name);
            tracing::trace!(cache = %self.name, waiter = id, "waiter deregistered");
        }
    }

    pub(crate) fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.write();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.is_live(now));
        let remaining = state.entries.len();
        drop(state);

        let removed = before - remaining;
        if removed > 0 {
            tracing::info!(cache = %self.name, removed, remaining, "swept expired entries");
        }
        metric!(counter("cache.sweep.removed") += removed as i64, "cache" => &self.name);
        metric!(gauge("cache.entries") = remaining as u64, "cache" => &self.name);
        removed
    }
}

/// The running computation of a key, owned by the task spawned for it.
///
/// If this is dropped before [`settle`](Self::settle) is called, because the computation panicked
/// or the runtime shut down underneath the task, the slot is torn down and every waiter receives
/// [`CacheError::Aborted`].
struct Episode<K, F: ComputeFunction<K>, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clock,
{
    shared: Arc<Shared<K, F, C>>,
    key: K,
    settled: bool,
}

impl<K, F, C> Episode<K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    fn settle(mut self, contents: Result<F::Value, F::Error>, ttl: Option<Duration>) {
        self.settled = true;
        self.shared.settle(&self.key, contents, ttl);
    }
}

impl<K, F, C> Drop for Episode<K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    fn drop(&mut self) {
        if !self.settled {
            self.shared.abort(&self.key);
        }
    }
}

/// A waiter's registration in a slot.
///
/// Dropping an active registration, on timeout or because the waiting future was cancelled,
/// removes the waiter from its slot.
struct Registration<'a, K, F: ComputeFunction<K>, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    C: Clock,
{
    shared: &'a Shared<K, F, C>,
    key: K,
    id: u64,
    active: bool,
}

impl<K, F, C> Drop for Registration<'_, K, F, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    fn drop(&mut self) {
        if self.active {
            self.shared.deregister(&self.key, self.id);
        }
    }
}
