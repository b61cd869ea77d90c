use std::sync::Arc;

use crate::alert::{AlertDeduper, AlertSinkJsonl};
use crate::audit::AuditLogger;
use crate::config::GatewayConfig;
use crate::correlator::Correlator;
use crate::error::Result;
use crate::idempotency::IdempotencyStore;
use crate::persistence::SqliteStore;
use crate::policy::HostPolicyEngine;
use crate::rate_limit::FixedWindowRateLimiter;

/// Shared per-process state wired into every handler.
pub struct AppState {
    pub config: GatewayConfig,
    pub correlator: Correlator,
    pub policy: HostPolicyEngine,
    pub rate_limiter: FixedWindowRateLimiter,
    pub idempotency: IdempotencyStore,
    pub deduper: AlertDeduper,
    pub alerts: AlertSinkJsonl,
    pub audit: AuditLogger,
}

impl AppState {
    pub async fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let store = if config.use_persistent_store {
            Some(SqliteStore::open(&config.persistent_store_path).await?)
        } else {
            None
        };

        let state = Self {
            correlator: Correlator::new(&config.correlation),
            policy: HostPolicyEngine::new(
                config.severity_floor,
                config.cooldown_seconds,
                &config.quarantine_on,
                store.clone(),
            ),
            rate_limiter: FixedWindowRateLimiter::new(
                config.rate_limit_per_minute,
                config.rate_limit_window_seconds,
            ),
            idempotency: IdempotencyStore::new(config.idempotency_ttl_seconds, store),
            deduper: AlertDeduper::new(config.alert_dedup_seconds),
            alerts: AlertSinkJsonl::new(&config.alert_path)?,
            audit: AuditLogger::new(&config.audit_path)?,
            config,
        };
        Ok(Arc::new(state))
    }
}
