use std::fmt::Debug;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// A source of time. Production code uses [`SystemClock`]; tests inject a fake
/// to drive cooldowns and TTLs without sleeping.
pub trait Clock: Send + Sync + Debug {
    /// Wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since this clock was created.
    fn elapsed(&self) -> Duration;

    /// Seconds since the Unix epoch, for TTL attributes.
    fn epoch_secs(&self) -> i64 {
        self.now_utc().timestamp()
    }
}

#[derive(Debug)]
pub struct SystemClock {
    started_at: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { started_at: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
