//! Durable key/value state on local SQLite: idempotency marks and host
//! policy rows. WAL journaling keeps commits crash-consistent while allowing
//! concurrent readers.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;

use crate::models::HostPolicyState;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS idempotency (
        event_id TEXT PRIMARY KEY,
        first_seen_utc TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS host_policy (
        host TEXT PRIMARY KEY,
        cooldown_until_utc TEXT NULL,
        quarantine INTEGER NOT NULL DEFAULT 0,
        updated_utc TEXT NOT NULL
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn idempo_seen(&self, event_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM idempotency WHERE event_id = ?1 LIMIT 1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn idempo_mark(
        &self,
        event_id: &str,
        first_seen_utc: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO idempotency(event_id, first_seen_utc) VALUES(?1, ?2)")
            .bind(event_id)
            .bind(format_instant(first_seen_utc))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete idempotency rows first seen before `cutoff`; returns the count.
    pub async fn idempo_gc(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM idempotency WHERE first_seen_utc < ?1")
            .bind(format_instant(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_host_state(
        &self,
        host: &str,
    ) -> Result<Option<HostPolicyState>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT cooldown_until_utc, quarantine FROM host_policy WHERE host = ?1",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let cooldown: Option<String> = row.get("cooldown_until_utc");
            let quarantine: i64 = row.get("quarantine");
            HostPolicyState {
                cooldown_until_utc: cooldown.as_deref().and_then(parse_instant),
                quarantine: quarantine != 0,
            }
        }))
    }

    pub async fn upsert_host_state(
        &self,
        host: &str,
        state: &HostPolicyState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO host_policy(host, cooldown_until_utc, quarantine, updated_utc) \
             VALUES(?1, ?2, ?3, ?4) \
             ON CONFLICT(host) DO UPDATE SET \
                 cooldown_until_utc = excluded.cooldown_until_utc, \
                 quarantine = excluded.quarantine, \
                 updated_utc = excluded.updated_utc",
        )
        .bind(host)
        .bind(state.cooldown_until_utc.map(format_instant))
        .bind(state.quarantine as i64)
        .bind(format_instant(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_quarantined(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT host FROM host_policy WHERE quarantine = 1 ORDER BY host")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("host")).collect())
    }
}

/// Fixed-width RFC 3339 so lexicographic SQL comparison matches time order.
fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
