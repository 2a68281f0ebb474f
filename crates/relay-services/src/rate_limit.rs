//! Rate limiter — C6, §6 "rate limits".
//!
//! Fixed-window per-group per-key limiter: each (group, key) pair gets a
//! window of `window_secs` during which at most `max` requests are allowed.
//! The window resets lazily on the first touch after it elapses.

use std::sync::Mutex;

use dashmap::DashMap;

use relay_core::Clock;
use std::sync::Arc;

struct Window {
    started_at: chrono::DateTime<chrono::Utc>,
    count: u64,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    windows: DashMap<(String, String), Mutex<Window>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
        }
    }

    /// Returns true if the request is allowed (and counts it), false if
    /// the window cap has been reached.
    pub fn allow(&self, group: &str, key: &str, max: u64, window_secs: u64) -> bool {
        if max == 0 {
            return true; // unlimited
        }
        let now = self.clock.now();
        let entry = self
            .windows
            .entry((group.to_string(), key.to_string()))
            .or_insert_with(|| Mutex::new(Window { started_at: now, count: 0 }));

        let mut window = entry.lock().unwrap();
        if now - window.started_at >= chrono::Duration::seconds(window_secs as i64) {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= max {
            return false;
        }
        window.count += 1;
        true
    }
}
