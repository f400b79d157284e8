use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::time::Instant;

use crate::rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterRegistry};

fn limiter(rate_per_sec: f64, burst: u64) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig { rate_per_sec, burst })
}

#[tokio::test(start_paused = true)]
async fn bucket_starts_empty_and_refills() {
    let limiter = limiter(10.0, 1);
    assert!(!limiter.acquire(1, false).await);

    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(limiter.acquire(1, false).await);
    // Consumed; the next non-blocking acquire fails again.
    assert!(!limiter.acquire(1, false).await);
}

#[tokio::test(start_paused = true)]
async fn blocking_acquire_waits_for_the_deficit() {
    let limiter = limiter(10.0, 1);
    let start = Instant::now();
    assert!(limiter.acquire(1, true).await);
    // One token at 10/s from an empty bucket takes 100ms.
    assert_eq!(start.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn refill_is_capped_at_burst() {
    let limiter = limiter(10.0, 2);
    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(limiter.current_tokens().await, 2.0);

    assert!(limiter.acquire(1, false).await);
    assert!(limiter.acquire(1, false).await);
    assert!(!limiter.acquire(1, false).await);
}

#[rstest]
#[case::single_worker(1)]
#[case::ten_workers(10)]
#[tokio::test(start_paused = true)]
async fn n_workers_sharing_the_limiter_observe_the_global_rate(#[case] workers: usize) {
    const TOTAL_REQUESTS: usize = 100;
    const RATE: f64 = 10.0;

    let limiter = Arc::new(limiter(RATE, 1));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..workers {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            let mut acquired = 0_usize;
            while acquired < TOTAL_REQUESTS / workers {
                assert!(limiter.acquire(1, true).await);
                acquired += 1;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 100 tokens at 10/s from an empty bucket: no faster than ~9.9s.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs_f64(9.9), "completed too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs_f64(11.0), "completed too slow: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn registry_returns_the_same_instance_per_upstream() {
    let registry = RateLimiterRegistry::new();
    let first = registry.get_or_create("coinbase", RateLimiterConfig::default());
    let second = registry.get_or_create("coinbase", RateLimiterConfig::default());
    let other = registry.get_or_create("coinbase_auth", RateLimiterConfig::default());

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));

    // Consuming through one handle is visible through the other.
    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(first.acquire(1, false).await);
    assert!(!second.acquire(1, false).await);
}
