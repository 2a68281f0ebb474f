//! Clock abstraction — C1.
//!
//! Every TTL, window, and expiry check in this codebase goes through this
//! trait rather than calling `Utc::now()` directly, so tests can advance
//! time deterministically instead of racing real wall-clock sleeps.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Injectable source of wall time.
///
/// `now()` is used for all TTL/expiry arithmetic persisted to storage
/// (expires_at fields, daily counter windows). A monotonic instant is
/// exposed separately for latency-sensitive bookkeeping (throttle pacing)
/// where wall-clock adjustments must not cause regressions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

/// Production clock — the real thing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic fake clock for tests.
///
/// `monotonic_now()` returns the real `Instant::now()` offset is not
/// simulated — throttle-pacing tests that need monotonic control should
/// exercise the throttle manager directly rather than through this fake.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().unwrap();
        *guard += chrono::Duration::from_std(by).expect("duration too large");
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.inner.lock().unwrap() = at;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().unwrap()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}
