//! Stateful correlation engine: evaluates the rule set over each host's
//! recent history and produces an explainable decision.

use chrono::Duration;
use serde_json::json;
use std::collections::HashSet;

use crate::config::CorrelationConfig;
use crate::models::{Context, CorrelationDecision, Decision, EventRecord};
use crate::store::RollingEventStore;

pub const REASON_INGEST_STORM: &str = "ingest_storm";
pub const REASON_BRUTE_FORCE: &str = "brute_force_suspected";
pub const REASON_PASSWORD_SPRAY: &str = "password_spray_suspected";
pub const REASON_SUCCESS_AFTER_FAILURES: &str = "success_after_failures";

const AUTH_CATEGORY: &str = "auth";
const LOGIN_FAILED: &str = "login_failed";
const LOGIN_SUCCESS: &str = "login_success";

/// Evaluates all rules against the rolling history of the event's host.
/// Holds no durable state of its own; history lives in the store. Rules
/// always record their diagnostic counters in the decision context so
/// operators can see near-misses.
pub struct Correlator {
    store: RollingEventStore,

    storm_window: Duration,
    storm_threshold: usize,

    brute_window: Duration,
    brute_threshold: usize,

    spray_window: Duration,
    spray_fail_threshold: usize,
    spray_unique_users_threshold: usize,

    success_window: Duration,
    success_prior_fail_threshold: usize,
}

impl Correlator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            store: RollingEventStore::new(config.store_window_seconds),
            storm_window: Duration::seconds(config.storm_window_seconds),
            storm_threshold: config.storm_threshold,
            brute_window: Duration::seconds(config.brute_window_seconds),
            brute_threshold: config.brute_threshold,
            spray_window: Duration::seconds(config.spray_window_seconds),
            spray_fail_threshold: config.spray_fail_threshold,
            spray_unique_users_threshold: config.spray_unique_users_threshold,
            success_window: Duration::seconds(config.success_window_seconds),
            success_prior_fail_threshold: config.success_prior_fail_threshold,
        }
    }

    /// Add the record to the store, then evaluate every rule against the
    /// host's retained history with the record's receive time as "now".
    pub fn evaluate(&self, record: &EventRecord) -> CorrelationDecision {
        self.store.add(record.clone());
        let recent = self.store.get_recent_at(&record.host, record.received_time_utc);
        let now = record.received_time_utc;

        let mut reasons: Vec<String> = Vec::new();
        let mut context = Context::new();

        // Rule 1: host event storm.
        let storm_cutoff = now - self.storm_window;
        let storm_count = recent
            .iter()
            .filter(|e| e.received_time_utc >= storm_cutoff)
            .count();
        context.insert("storm_count".into(), json!(storm_count));
        context.insert(
            "storm_window_seconds".into(),
            json!(self.storm_window.num_seconds()),
        );
        if storm_count > self.storm_threshold {
            reasons.push(REASON_INGEST_STORM.to_string());
        }

        // Rule 2: brute force, login_failed burst for one user.
        let brute_cutoff = now - self.brute_window;
        let user = record.user.as_deref().unwrap_or("unknown");
        let fail_count = recent
            .iter()
            .filter(|e| {
                e.received_time_utc >= brute_cutoff
                    && e.category == AUTH_CATEGORY
                    && e.action == LOGIN_FAILED
                    && e.user.as_deref().unwrap_or("unknown") == user
            })
            .count();
        context.insert("brute_user".into(), json!(user));
        context.insert("login_failed_count".into(), json!(fail_count));
        context.insert(
            "brute_window_seconds".into(),
            json!(self.brute_window.num_seconds()),
        );
        if fail_count >= self.brute_threshold {
            reasons.push(REASON_BRUTE_FORCE.to_string());
        }

        // Rule 3: password spray, many distinct users failing from one src_ip.
        if let Some(src_ip) = record.src_ip.as_deref() {
            let spray_cutoff = now - self.spray_window;
            let spray_fails: Vec<&EventRecord> = recent
                .iter()
                .filter(|e| {
                    e.received_time_utc >= spray_cutoff
                        && e.category == AUTH_CATEGORY
                        && e.action == LOGIN_FAILED
                        && e.src_ip.as_deref() == Some(src_ip)
                })
                .collect();
            let unique_users: HashSet<&str> = spray_fails
                .iter()
                .map(|e| e.user.as_deref().unwrap_or("unknown"))
                .collect();

            context.insert("spray_src_ip".into(), json!(src_ip));
            context.insert("spray_fail_count".into(), json!(spray_fails.len()));
            context.insert("spray_unique_users".into(), json!(unique_users.len()));
            context.insert(
                "spray_window_seconds".into(),
                json!(self.spray_window.num_seconds()),
            );

            if spray_fails.len() >= self.spray_fail_threshold
                && unique_users.len() >= self.spray_unique_users_threshold
            {
                reasons.push(REASON_PASSWORD_SPRAY.to_string());
            }
        }

        // Rule 4: login_success preceded by repeated failures for the user.
        if record.category == AUTH_CATEGORY && record.action == LOGIN_SUCCESS {
            let success_cutoff = now - self.success_window;
            let prior_fails = recent
                .iter()
                .filter(|e| {
                    e.received_time_utc >= success_cutoff
                        && e.category == AUTH_CATEGORY
                        && e.action == LOGIN_FAILED
                        && e.user.as_deref().unwrap_or("unknown") == user
                })
                .count();
            context.insert("success_user".into(), json!(user));
            context.insert("success_prior_fail_count".into(), json!(prior_fails));
            context.insert(
                "success_window_seconds".into(),
                json!(self.success_window.num_seconds()),
            );
            if prior_fails >= self.success_prior_fail_threshold {
                reasons.push(REASON_SUCCESS_AFTER_FAILURES.to_string());
            }
        }

        let decision = decide(&reasons);
        context.insert("recent_events_kept".into(), json!(recent.len()));

        CorrelationDecision {
            event_id: record.event_id.clone(),
            host: record.host.clone(),
            decision,
            reasons,
            context,
        }
    }
}

/// BLOCK only when a storm coincides with an auth-abuse rule; any lone
/// reason throttles.
fn decide(reasons: &[String]) -> Decision {
    let has = |tag: &str| reasons.iter().any(|r| r == tag);
    if has(REASON_INGEST_STORM) && (has(REASON_BRUTE_FORCE) || has(REASON_PASSWORD_SPRAY)) {
        Decision::Block
    } else if !reasons.is_empty() {
        Decision::Throttle
    } else {
        Decision::Allow
    }
}
