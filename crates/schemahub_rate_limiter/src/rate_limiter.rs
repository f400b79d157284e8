use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use validator::Validate;

use crate::metrics::{
    RATE_LIMITER_REJECTIONS,
    RATE_LIMITER_TOKENS_GRANTED,
    RATE_LIMITER_WAIT_SECS,
};

const DEFAULT_RATE_PER_SEC: f64 = 10.0;
// No bursting: tokens accrue one interval at a time, keeping the request
// stream at a steady cadence instead of front-loading after idle periods.
const DEFAULT_BURST: u64 = 1;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct RateLimiterConfig {
    #[validate(range(min = 0.001))]
    pub rate_per_sec: f64,
    #[validate(range(min = 1))]
    pub burst: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { rate_per_sec: DEFAULT_RATE_PER_SEC, burst: DEFAULT_BURST }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Token-bucket limiter shared by every worker calling one upstream. The
/// bucket starts empty, refills at `rate_per_sec` up to `burst`, and blocking
/// acquires sleep outside the mutex for a span proportional to the caller's
/// token deficit.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        info!(
            rate_per_sec = config.rate_per_sec,
            burst = config.burst,
            "Rate limiter initialized."
        );
        Self { config, bucket: Mutex::new(Bucket { tokens: 0.0, last_update: Instant::now() }) }
    }

    /// Consumes `tokens` from the bucket. With `block`, the caller is
    /// suspended until refill covers the request; otherwise returns `false`
    /// immediately when the bucket is short.
    pub async fn acquire(&self, tokens: u64, block: bool) -> bool {
        #[allow(clippy::as_conversions)]
        let needed = tokens as f64;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
                #[allow(clippy::as_conversions)]
                let burst = self.config.burst as f64;
                bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_sec).min(burst);
                bucket.last_update = now;

                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    RATE_LIMITER_TOKENS_GRANTED.increment(tokens);
                    return true;
                }
                if !block {
                    RATE_LIMITER_REJECTIONS.increment(1);
                    return false;
                }
                let deficit = needed - bucket.tokens;
                Duration::from_secs_f64(deficit / self.config.rate_per_sec)
            };

            // Sleeping outside the mutex keeps other callers from convoying
            // behind a waiter that holds the lock.
            debug!(wait_secs = wait.as_secs_f64(), "Waiting for rate limiter refill.");
            RATE_LIMITER_WAIT_SECS.record(wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token balance after refill, for monitoring.
    pub async fn current_tokens(&self) -> f64 {
        let bucket = self.bucket.lock().await;
        let elapsed = bucket.last_update.elapsed().as_secs_f64();
        #[allow(clippy::as_conversions)]
        let burst = self.config.burst as f64;
        (bucket.tokens + elapsed * self.config.rate_per_sec).min(burst)
    }
}

/// Process-scoped registry handing out one shared limiter per upstream name.
/// Built once at startup; hot paths only clone the `Arc`.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: StdMutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, upstream: &str, config: RateLimiterConfig) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap();
        limiters
            .entry(upstream.to_owned())
            .or_insert_with(|| Arc::new(RateLimiter::new(config)))
            .clone()
    }
}
