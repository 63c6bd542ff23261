use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Time source injected into every subsystem so staleness and expiry
/// decisions are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().expect("clock lock");
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

/// Bounded exponential backoff schedule for retry loops.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub const fn new(base: Duration, cap: Duration, max_attempts: usize) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Registry mutations on the worker boot path: the caller is waiting.
    pub const fn allocator() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), 10)
    }

    /// Periodic reclaimer: patient, outlasts heavy contention.
    pub const fn reclaimer() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10), 60)
    }

    /// Stats are advisory; short fuse, sub-second jittered delays.
    pub const fn stats() -> Self {
        Self::new(Duration::from_millis(20), Duration::from_millis(100), 5)
    }

    /// Delay before retry number `attempt` (0-based), capped.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exp = attempt.min(16) as u32;
        let scaled = self
            .base
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.cap);
        scaled.min(self.cap)
    }
}
