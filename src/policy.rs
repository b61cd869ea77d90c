//! Per-host policy state machine: cooldown and quarantine enforcement,
//! driven by correlation verdicts.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Context, CorrelationDecision, Decision, EventRecord, HostPolicyState};
use crate::persistence::SqliteStore;

pub const REASON_BELOW_SEVERITY_FLOOR: &str = "below_severity_floor";
pub const REASON_HOST_QUARANTINED: &str = "host_quarantined";
pub const REASON_COOLDOWN_ACTIVE: &str = "cooldown_active";
pub const REASON_QUARANTINE_ACTIVATED: &str = "quarantine_activated";
pub const REASON_CORRELATION_BLOCK: &str = "correlation_block";
pub const REASON_SUSPICIOUS_COOLDOWN_SET: &str = "suspicious_cooldown_set";
pub const REASON_OK: &str = "ok";

/// Policy decision output from the final enforcement layer.
///
/// Each host gets a mutex-guarded slot so one evaluation (including its
/// write-through to the persistent table) is atomic per host. Slots hydrate
/// from the persistent store on first access within the process; every state
/// change is written through before the decision is returned.
pub struct HostPolicyEngine {
    severity_floor: u8,
    cooldown: Duration,
    quarantine_on: HashSet<String>,
    slots: DashMap<String, Arc<Mutex<HostSlot>>>,
    store: Option<SqliteStore>,
}

struct HostSlot {
    hydrated: bool,
    state: HostPolicyState,
}

impl HostPolicyEngine {
    pub fn new(
        severity_floor: u8,
        cooldown_seconds: i64,
        quarantine_on: &[String],
        store: Option<SqliteStore>,
    ) -> Self {
        Self {
            severity_floor,
            cooldown: Duration::seconds(cooldown_seconds),
            quarantine_on: quarantine_on.iter().cloned().collect(),
            slots: DashMap::new(),
            store,
        }
    }

    pub async fn evaluate(
        &self,
        record: &EventRecord,
        corr: &CorrelationDecision,
    ) -> Result<PolicyOutcome> {
        self.evaluate_at(record, corr, Utc::now()).await
    }

    pub async fn evaluate_at(
        &self,
        record: &EventRecord,
        corr: &CorrelationDecision,
        now: DateTime<Utc>,
    ) -> Result<PolicyOutcome> {
        let mut context = Context::new();
        context.insert("correlation_decision".into(), json!(corr.decision));
        context.insert("correlation_reasons".into(), json!(corr.reasons));

        // Low-value signals are muted but still recorded upstream.
        if record.severity < self.severity_floor {
            context.insert("severity".into(), json!(record.severity));
            context.insert("severity_floor".into(), json!(self.severity_floor));
            return Ok(PolicyOutcome::new(
                record,
                Decision::Throttle,
                REASON_BELOW_SEVERITY_FLOOR,
                context,
            ));
        }

        let slot = self.slot(&record.host);
        let mut guard = slot.lock().await;
        self.hydrate(&record.host, &mut guard).await?;

        if guard.state.quarantine {
            return Ok(PolicyOutcome::new(
                record,
                Decision::Block,
                REASON_HOST_QUARANTINED,
                context,
            ));
        }

        if let Some(until) = guard.state.cooldown_until_utc {
            if now < until {
                context.insert("cooldown_until_utc".into(), json!(until));
                return Ok(PolicyOutcome::new(
                    record,
                    Decision::Block,
                    REASON_COOLDOWN_ACTIVE,
                    context,
                ));
            }
        }

        // A quarantine-listed reason escalates on its first firing, before
        // the overall correlation verdict is consulted.
        if corr.reasons.iter().any(|r| self.quarantine_on.contains(r)) {
            guard.state.quarantine = true;
            self.persist(&record.host, &guard.state).await?;
            context.insert("quarantined_at_utc".into(), json!(now));
            return Ok(PolicyOutcome::new(
                record,
                Decision::Block,
                REASON_QUARANTINE_ACTIVATED,
                context,
            ));
        }

        match corr.decision {
            Decision::Block => {
                let until = now + self.cooldown;
                guard.state.cooldown_until_utc = Some(until);
                self.persist(&record.host, &guard.state).await?;
                context.insert("cooldown_set_until_utc".into(), json!(until));
                Ok(PolicyOutcome::new(
                    record,
                    Decision::Block,
                    REASON_CORRELATION_BLOCK,
                    context,
                ))
            }
            Decision::Throttle => {
                let until = now + self.cooldown;
                guard.state.cooldown_until_utc = Some(until);
                self.persist(&record.host, &guard.state).await?;
                context.insert("cooldown_set_until_utc".into(), json!(until));
                Ok(PolicyOutcome::new(
                    record,
                    Decision::Throttle,
                    REASON_SUSPICIOUS_COOLDOWN_SET,
                    context,
                ))
            }
            Decision::Allow => Ok(PolicyOutcome::new(record, Decision::Allow, REASON_OK, context)),
        }
    }

    /// Current state snapshot for observability.
    pub async fn get_state(&self, host: &str) -> Result<HostPolicyState> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;
        self.hydrate(host, &mut guard).await?;
        Ok(guard.state.clone())
    }

    pub async fn list_quarantined(&self) -> Result<Vec<String>> {
        if let Some(store) = &self.store {
            return store.list_quarantined().await.map_err(Into::into);
        }
        // Snapshot the slot handles before awaiting so no shard lock is
        // held across a suspension point.
        let slots: Vec<(String, Arc<Mutex<HostSlot>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut hosts = Vec::new();
        for (host, slot) in slots {
            if slot.lock().await.state.quarantine {
                hosts.push(host);
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    /// External clear operation: drops quarantine and any pending cooldown.
    pub async fn clear_host(&self, host: &str) -> Result<HostPolicyState> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;
        self.hydrate(host, &mut guard).await?;
        guard.state = HostPolicyState::default();
        self.persist(host, &guard.state).await?;
        Ok(guard.state.clone())
    }

    fn slot(&self, host: &str) -> Arc<Mutex<HostSlot>> {
        self.slots
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(HostSlot {
                    hydrated: false,
                    state: HostPolicyState::default(),
                }))
            })
            .clone()
    }

    async fn hydrate(&self, host: &str, slot: &mut HostSlot) -> Result<()> {
        if slot.hydrated {
            return Ok(());
        }
        if let Some(store) = &self.store {
            if let Some(state) = store.get_host_state(host).await? {
                slot.state = state;
            }
        }
        slot.hydrated = true;
        Ok(())
    }

    async fn persist(&self, host: &str, state: &HostPolicyState) -> Result<()> {
        if let Some(store) = &self.store {
            store.upsert_host_state(host, state).await?;
        }
        Ok(())
    }
}

/// Decision plus the single policy reason that produced it.
pub struct PolicyOutcome {
    pub decision: Decision,
    pub reason: String,
    pub context: Context,
    event_id: String,
    host: String,
}

impl PolicyOutcome {
    fn new(record: &EventRecord, decision: Decision, reason: &str, context: Context) -> Self {
        Self {
            decision,
            reason: reason.to_string(),
            context,
            event_id: record.event_id.clone(),
            host: record.host.clone(),
        }
    }

    pub fn into_decision(self) -> crate::models::PolicyDecision {
        crate::models::PolicyDecision {
            event_id: self.event_id,
            host: self.host,
            decision: self.decision,
            reasons: vec![self.reason],
            context: self.context,
        }
    }
}
