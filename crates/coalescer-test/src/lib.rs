//! Helpers for testing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`counting`] to wrap a plain function into a slow, counted computation. Hold on to the
//!    returned [`Calls`] to assert how often the cache actually computed something.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalescer_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts the invocations of a computation created by [`counting`].
#[derive(Clone, Debug, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    /// The number of computations started so far.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Turns `f` into an asynchronous computation that takes `delay` to complete.
///
/// Every invocation is counted in the returned [`Calls`]. The counter is bumped as soon as the
/// computation is started, not when it completes.
pub fn counting<K, V, E, F>(
    delay: Duration,
    f: F,
) -> (
    Calls,
    impl Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync + 'static,
)
where
    K: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
    F: Fn(K) -> Result<V, E> + Send + Sync + 'static,
{
    let calls = Calls::default();
    let f = Arc::new(f);

    let counter = calls.clone();
    let compute = move |key: K| -> BoxFuture<'static, Result<V, E>> {
        counter.0.fetch_add(1, Ordering::SeqCst);
        let f = Arc::clone(&f);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            f(key)
        })
    };

    (calls, compute)
}
