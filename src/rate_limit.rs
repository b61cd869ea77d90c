//! Fixed-window request budget, keyed by host.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

struct WindowCounter {
    window_start: DateTime<Utc>,
    count: u32,
}

/// Per-key fixed window limiter: up to `limit` events per `window_seconds`.
/// Counters are sharded by key, so hosts never contend with each other.
pub struct FixedWindowRateLimiter {
    limit: u32,
    window: Duration,
    counters: DashMap<String, WindowCounter>,
}

impl FixedWindowRateLimiter {
    pub fn new(limit: u32, window_seconds: i64) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_seconds),
            counters: DashMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Utc::now())
    }

    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut counter = self.counters.entry(key.to_string()).or_insert(WindowCounter {
            window_start: now,
            count: 0,
        });

        if now - counter.window_start >= self.window {
            counter.window_start = now;
            counter.count = 1;
            return true;
        }

        if counter.count >= self.limit {
            return false;
        }

        counter.count += 1;
        true
    }
}
