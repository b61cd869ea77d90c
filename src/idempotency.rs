//! Event-id dedupe across the configured retention window.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::persistence::SqliteStore;

/// Run a persistent GC sweep once per this many marks.
const GC_EVERY_MARKS: u64 = 512;

/// Set of observed event ids with first-seen instants. Defers to the
/// persistent store when one is configured; otherwise the in-memory map is
/// authoritative and garbage-collects on read.
pub struct IdempotencyStore {
    ttl: Duration,
    seen: DashMap<String, DateTime<Utc>>,
    store: Option<SqliteStore>,
    marks: AtomicU64,
}

impl IdempotencyStore {
    pub fn new(ttl_seconds: i64, store: Option<SqliteStore>) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds),
            seen: DashMap::new(),
            store,
            marks: AtomicU64::new(0),
        }
    }

    pub async fn seen(&self, event_id: &str) -> Result<bool> {
        if let Some(store) = &self.store {
            return store.idempo_seen(event_id).await.map_err(Into::into);
        }
        self.gc_memory(Utc::now());
        Ok(self.seen.contains_key(event_id))
    }

    pub async fn mark(&self, event_id: &str) -> Result<()> {
        let now = Utc::now();
        self.marks.fetch_add(1, Ordering::Relaxed);
        if let Some(store) = &self.store {
            store.idempo_mark(event_id, now).await?;
        } else {
            self.seen.insert(event_id.to_string(), now);
        }
        Ok(())
    }

    /// Opportunistic GC of expired marks. The persistent sweep only runs on
    /// a sampling of calls; failures are logged, never surfaced.
    pub async fn maybe_gc(&self) {
        let Some(store) = &self.store else { return };
        if self.marks.load(Ordering::Relaxed) % GC_EVERY_MARKS != 0 {
            return;
        }
        match store.idempo_gc(Utc::now() - self.ttl).await {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(deleted, "idempotency gc"),
            Err(e) => tracing::warn!(error = %e, "idempotency gc failed"),
        }
    }

    fn gc_memory(&self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        self.seen.retain(|_, first_seen| *first_seen >= cutoff);
    }
}
