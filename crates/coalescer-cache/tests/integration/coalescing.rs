use std::time::Duration;

use coalescer_cache::{CacheError, CoalescingCache, KeyState};
use coalescer_test::{counting, setup};

const TTL: Option<Duration> = Some(Duration::from_secs(60));

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_compute_once() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(100), |key: u64| Ok::<_, String>(key * 2));
    let cache = CoalescingCache::new(compute);

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_compute(21, TTL).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(42));
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(cache.size(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_computation_per_key() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(50), |key: u64| Ok::<_, String>(key));
    let cache = CoalescingCache::new(compute);

    let tasks: Vec<_> = (0..8u64)
        .flat_map(|key| std::iter::repeat_n(key, 16))
        .map(|key| {
            let cache = cache.clone();
            tokio::spawn(async move { (key, cache.get_or_compute(key, TTL).await) })
        })
        .collect();

    for task in tasks {
        let (key, result) = task.await.unwrap();
        assert_eq!(result, Ok(key));
    }
    assert_eq!(calls.get(), 8);
    assert_eq!(cache.size(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_three_staggered_callers() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(50), |_key: String| {
        Ok::<u32, String>(42)
    });
    let cache = CoalescingCache::new(compute);
    let ttl = Some(Duration::from_secs(1));

    let first = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute("k".to_owned(), ttl).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute("k".to_owned(), ttl).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let third = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute("k".to_owned(), ttl).await }
    });

    assert_eq!(first.await.unwrap(), Ok(42));
    assert_eq!(second.await.unwrap(), Ok(42));
    assert_eq!(third.await.unwrap(), Ok(42));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_reach_every_caller() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(50), |key: u64| {
        u64::checked_pow(10, key as u32).ok_or_else(|| format!("10^{key} overflows"))
    });
    let cache = CoalescingCache::new(compute);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_compute(100, TTL).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(
            task.await.unwrap(),
            Err(CacheError::Compute("10^100 overflows".to_owned()))
        );
    }
    assert_eq!(cache.get_or_compute(3, TTL).await, Ok(1000));
    assert_eq!(calls.get(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_waiter_does_not_disturb_others() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(300), |key: u64| Ok::<_, String>(key));
    let cache = CoalescingCache::new(compute);

    let computer = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute(1, TTL).await }
    });
    while cache.state(&1) == KeyState::Idle {
        tokio::task::yield_now().await;
    }
    let patient = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute(1, TTL).await }
    });

    let timeout = Duration::from_millis(20);
    assert_eq!(
        cache.get_or_compute_timeout(1, TTL, timeout).await,
        Err(CacheError::Timeout(timeout))
    );

    assert_eq!(computer.await.unwrap(), Ok(1));
    assert_eq!(patient.await.unwrap(), Ok(1));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aborted_caller_does_not_cancel_the_computation() {
    setup();
    let (calls, compute) = counting(Duration::from_millis(200), |key: u64| Ok::<_, String>(key));
    let cache = CoalescingCache::new(compute);

    let computer = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute(7, TTL).await }
    });
    while cache.state(&7) != (KeyState::InProgress { waiters: 1 }) {
        tokio::task::yield_now().await;
    }
    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get_or_compute(7, TTL).await }
    });
    while cache.state(&7) != (KeyState::InProgress { waiters: 2 }) {
        tokio::task::yield_now().await;
    }

    computer.abort();
    assert!(computer.await.unwrap_err().is_cancelled());

    assert_eq!(waiter.await.unwrap(), Ok(7));
    assert_eq!(cache.state(&7), KeyState::Settled);
    assert_eq!(calls.get(), 1);
}
