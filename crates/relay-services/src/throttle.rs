//! Throttle manager — C5, §4.3.
//!
//! A pacing reservation, not a token bucket: given a byte count, compute
//! `duration = bytes / rate_bps`, advance the limiter's `next` time-point to
//! `max(now, next) + duration`, and hand the caller `max(0, next - now)` as
//! the sleep budget. One limiter per transfer, plus one global limiter.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Limiter {
    next: Instant,
    rate_bps: u64,
}

impl Limiter {
    fn new(rate_bps: u64) -> Self {
        Self {
            next: Instant::now(),
            rate_bps,
        }
    }

    fn reserve(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.rate_bps == 0 {
            return Duration::ZERO; // unlimited
        }
        let duration = Duration::from_secs_f64(bytes as f64 / self.rate_bps as f64);
        let start = self.next.max(now);
        self.next = start + duration;
        self.next.saturating_duration_since(now)
    }
}

pub struct ThrottleManager {
    per_transfer: DashMap<String, Mutex<Limiter>>,
    global: Mutex<Limiter>,
    per_transfer_rate_bps: u64,
}

impl ThrottleManager {
    pub fn new(per_transfer_rate_bps: u64, global_rate_bps: u64) -> Self {
        Self {
            per_transfer: DashMap::new(),
            global: Mutex::new(Limiter::new(global_rate_bps)),
            per_transfer_rate_bps,
        }
    }

    /// Returns the caller's sleep budget before proceeding with `bytes` of I/O.
    pub fn reserve(&self, transfer_id: &str, bytes: u64) -> Duration {
        let now = Instant::now();

        let transfer_delay = {
            let entry = self
                .per_transfer
                .entry(transfer_id.to_string())
                .or_insert_with(|| Mutex::new(Limiter::new(self.per_transfer_rate_bps)));
            entry.lock().unwrap().reserve(bytes, now)
        };

        let global_delay = self.global.lock().unwrap().reserve(bytes, now);

        transfer_delay.max(global_delay)
    }

    /// Drop a transfer's limiter once it is finalized or deleted.
    pub fn forget(&self, transfer_id: &str) {
        self.per_transfer.remove(transfer_id);
    }
}
