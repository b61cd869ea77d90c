//! Per-host rolling event history, bounded by time.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

use crate::models::EventRecord;

/// Time-windowed per-host event store. Entries are trimmed on every add
/// (against the record's receive time) and on every read (against the wall
/// clock), so callers never observe entries older than the window.
pub struct RollingEventStore {
    window: Duration,
    events: DashMap<String, VecDeque<EventRecord>>,
}

impl RollingEventStore {
    pub fn new(window_seconds: i64) -> Self {
        Self {
            window: Duration::seconds(window_seconds),
            events: DashMap::new(),
        }
    }

    pub fn add(&self, record: EventRecord) {
        let cutoff = record.received_time_utc - self.window;
        let mut queue = self.events.entry(record.host.clone()).or_default();
        queue.push_back(record);
        Self::trim(&mut queue, cutoff);
    }

    /// Snapshot of the host's retained history, oldest first.
    pub fn get_recent(&self, host: &str) -> Vec<EventRecord> {
        self.get_recent_at(host, Utc::now())
    }

    pub fn get_recent_at(&self, host: &str, now: DateTime<Utc>) -> Vec<EventRecord> {
        match self.events.get_mut(host) {
            Some(mut queue) => {
                Self::trim(&mut queue, now - self.window);
                queue.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    fn trim(queue: &mut VecDeque<EventRecord>, cutoff: DateTime<Utc>) {
        while queue
            .front()
            .map_or(false, |e| e.received_time_utc < cutoff)
        {
            queue.pop_front();
        }
    }
}
