use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::Shared;
use crate::clock::Clock;
use crate::compute::ComputeFunction;

/// Stops the periodic expiry sweep when dropped.
#[derive(Debug)]
pub(crate) struct SweeperGuard(AbortHandle);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns a task removing expired entries from `shared` every `interval`.
///
/// The task only holds a weak reference, so it never keeps a cache alive. Returns `None` if the
/// interval is zero or there is no Tokio runtime to spawn on.
pub(crate) fn spawn<K, F, C>(shared: &Arc<Shared<K, F, C>>, interval: Duration) -> Option<SweeperGuard>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    F: ComputeFunction<K>,
    C: Clock,
{
    let name = shared.name().to_owned();
    if interval.is_zero() {
        tracing::warn!(cache = %name, "ignoring zero sweep interval");
        return None;
    }
    let Ok(runtime) = Handle::try_current() else {
        tracing::warn!(cache = %name, "no runtime available, expired entries are only removed lazily");
        return None;
    };

    let cache = Arc::downgrade(shared);
    let task = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(cache) = cache.upgrade() else {
                break;
            };
            cache.sweep();
        }

        tracing::trace!(cache = %name, "expiry sweeper stopped");
    });

    tracing::debug!(cache = %shared.name(), "started expiry sweeper every {:?}", interval);
    Some(SweeperGuard(task.abort_handle()))
}

#[cfg(test)]
mod tests {
    use crate::CoalescingCache;

    use super::*;

    async fn compute(key: u32) -> Result<u32, ()> {
        Ok(key)
    }

    #[tokio::test]
    async fn test_periodic_sweep() {
        tokio::time::pause();
        let cache = CoalescingCache::builder(compute)
            .sweep_interval(Some(Duration::from_secs(1)))
            .build();

        cache.set(1, 1, Some(Duration::from_millis(100)));
        cache.set(2, 2, None);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(cache.size(), 1);
        // the expired entry is gone, not just hidden
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_is_ignored() {
        let cache = CoalescingCache::builder(compute)
            .sweep_interval(Some(Duration::ZERO))
            .build();

        assert!(!format!("{cache:?}").contains("sweeper: true"));
    }

    #[test]
    fn test_no_runtime_no_sweeper() {
        let cache = CoalescingCache::builder(compute)
            .sweep_interval(Some(Duration::from_secs(1)))
            .build();

        cache.set(1, 1, None);
        assert_eq!(cache.get(&1), Some(Ok(1)));
        assert!(format!("{cache:?}").contains("sweeper: false"));
    }
}
