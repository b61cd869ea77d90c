//! Alert construction, dedupe, and the durable JSON-lines sink.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::correlator::{
    REASON_BRUTE_FORCE, REASON_INGEST_STORM, REASON_PASSWORD_SPRAY, REASON_SUCCESS_AFTER_FAILURES,
};
use crate::models::{Context, EventRecord};

/// Append-only alert record; never mutated after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub rule_id: String,
    pub host: String,
    pub severity: u8,
    pub confidence: f64,
    pub created_time_utc: DateTime<Utc>,
    pub user: Option<String>,
    pub src_ip: Option<String>,
    pub reasons: Vec<String>,
    pub context: Context,
}

#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub rule_id: &'static str,
    pub severity: u8,
    pub confidence: f64,
}

/// Fixed translation from correlation reasons to alert rules.
pub fn rule_for_reason(reason: &str) -> Option<RuleSpec> {
    match reason {
        REASON_BRUTE_FORCE => Some(RuleSpec {
            rule_id: "BRUTE_FORCE_V1",
            severity: 7,
            confidence: 0.75,
        }),
        REASON_PASSWORD_SPRAY => Some(RuleSpec {
            rule_id: "PASSWORD_SPRAY_V1",
            severity: 8,
            confidence: 0.80,
        }),
        REASON_SUCCESS_AFTER_FAILURES => Some(RuleSpec {
            rule_id: "SUCCESS_AFTER_FAILURES_V1",
            severity: 8,
            confidence: 0.70,
        }),
        REASON_INGEST_STORM => Some(RuleSpec {
            rule_id: "INGEST_STORM_V1",
            severity: 5,
            confidence: 0.60,
        }),
        _ => None,
    }
}

pub fn build_alert(rule: RuleSpec, record: &EventRecord, reason: &str, context: Context) -> Alert {
    Alert {
        alert_id: Uuid::new_v4().to_string(),
        rule_id: rule.rule_id.to_string(),
        host: record.host.clone(),
        severity: rule.severity,
        confidence: rule.confidence,
        created_time_utc: Utc::now(),
        user: record.user.clone(),
        src_ip: record.src_ip.clone(),
        reasons: vec![reason.to_string()],
        context,
    }
}

/// Suppresses repeated alerts for the same signal.
///
/// Key is (rule, host, user, src_ip). First sight emits and records the
/// instant; later sights within the TTL are dropped without touching the
/// recorded instant (leaky bucket of size one).
pub struct AlertDeduper {
    ttl: Duration,
    last_emit: DashMap<String, DateTime<Utc>>,
}

impl AlertDeduper {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds),
            last_emit: DashMap::new(),
        }
    }

    pub fn should_emit(
        &self,
        rule_id: &str,
        host: &str,
        user: Option<&str>,
        src_ip: Option<&str>,
    ) -> bool {
        self.should_emit_at(rule_id, host, user, src_ip, Utc::now())
    }

    pub fn should_emit_at(
        &self,
        rule_id: &str,
        host: &str,
        user: Option<&str>,
        src_ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let key = format!(
            "{rule_id}|{host}|{}|{}",
            user.unwrap_or(""),
            src_ip.unwrap_or("")
        );
        match self.last_emit.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if now - *slot.get() >= self.ttl {
                    slot.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Durable append-only alert sink. One compact JSON object per line; the
/// file is opened in append mode per write so records survive process
/// crashes. Write failures never propagate into the request path.
pub struct AlertSinkJsonl {
    path: PathBuf,
    write_lock: Mutex<()>,
    write_errors: AtomicU64,
}

impl AlertSinkJsonl {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
            write_errors: AtomicU64::new(0),
        })
    }

    pub fn emit(&self, alert: &Alert) {
        if let Err(e) = self.append(alert) {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, alert_id = %alert.alert_id, "alert sink write failed");
        }
    }

    /// Last `limit` alerts in the sink, oldest first. Unparseable lines are
    /// skipped; a missing file reads as empty.
    pub fn read_recent(&self, limit: usize) -> Vec<serde_json::Value> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let mut rows: Vec<serde_json::Value> = data
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(limit)
            .collect();
        rows.reverse();
        rows
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn append(&self, alert: &Alert) -> std::io::Result<()> {
        let line = serde_json::to_string(alert)?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}
