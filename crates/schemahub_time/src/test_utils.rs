use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
    base: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self { base, offset: Mutex::new(Duration::ZERO) }
    }

    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset = offset.saturating_add(duration);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FakeClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().unwrap();
        self.base + chrono::Duration::from_std(offset).expect("offset fits in chrono::Duration")
    }

    fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap()
    }
}
