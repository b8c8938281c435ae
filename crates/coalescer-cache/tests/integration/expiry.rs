use std::time::Duration;

use coalescer_cache::{CacheConfig, CoalescingCache, KeyState};
use coalescer_test::{counting, setup};

#[tokio::test]
async fn test_ttl_in_real_time() {
    setup();
    let (calls, compute) = counting(Duration::ZERO, |key: u64| Ok::<_, String>(key));
    let cache = CoalescingCache::new(compute);

    cache.set(1, 1, Some(Duration::from_millis(100)));
    cache.set(2, 2, Some(Duration::ZERO));
    assert_eq!(cache.get(&1), Some(Ok(1)));

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.get(&2), Some(Ok(2)));
    assert_eq!(cache.size(), 1);
    assert_eq!(calls.get(), 0);
}

#[tokio::test]
async fn test_configured_sweeper_removes_expired_entries() {
    setup();
    tokio::time::pause();
    let (calls, compute) = counting(Duration::from_millis(10), |key: u64| Ok::<_, String>(key));
    let config = CacheConfig {
        name: "sweeping".into(),
        ttl: Some(Duration::from_secs(1)),
        waiter_timeout: None,
        sweep_interval: Some(Duration::from_secs(5)),
    };
    let cache = CoalescingCache::from_config(&config, compute);

    for key in 0..10 {
        assert_eq!(cache.get_or_compute(key, config.ttl).await, Ok(key));
    }
    assert_eq!(cache.size(), 10);

    tokio::time::sleep(Duration::from_secs(6)).await;

    // the sweeper already dropped everything, nothing is left to sweep
    assert_eq!(cache.sweep(), 0);
    assert_eq!(cache.state(&0), KeyState::Idle);
    assert_eq!(calls.get(), 10);
}
