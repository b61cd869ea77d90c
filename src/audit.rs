//! Append-only structured audit trail.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// JSON-lines audit logger. Every decision the gateway takes lands here as
/// one compact record; writes are serialised so each record is a whole line.
/// Failures are swallowed and counted so the request path never sees them.
pub struct AuditLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
    write_errors: AtomicU64,
}

impl AuditLogger {
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

    /// Append one record, stamping `received_time_utc` when absent.
    pub fn write(&self, mut record: Value) {
        if let Some(obj) = record.as_object_mut() {
            obj.entry("received_time_utc")
                .or_insert_with(|| json!(Utc::now()));
        }
        if let Err(e) = self.append(&record) {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "audit write failed");
        }
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn append(&self, record: &Value) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}
