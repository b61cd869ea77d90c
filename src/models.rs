use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Free-form diagnostic payload attached to correlation and policy decisions.
pub type Context = serde_json::Map<String, serde_json::Value>;

pub const EVENT_TYPE_V1: &str = "sec.event.v1";

/// Inbound wire schema for one security event.
///
/// Unknown top-level fields are rejected, and `timestamp_utc` must carry an
/// explicit offset (naive timestamps fail RFC 3339 parsing).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SecurityEventV1 {
    #[validate(custom = "validate_event_type")]
    pub event_type: String,

    #[validate(length(min = 8, max = 128))]
    pub event_id: String,

    #[validate(length(min = 1, max = 64))]
    pub source: String,

    #[validate(length(min = 1, max = 128))]
    pub host: String,

    pub timestamp_utc: DateTime<Utc>,

    #[validate(length(min = 1, max = 64))]
    pub category: String,

    #[validate(length(min = 1, max = 64))]
    pub action: String,

    #[validate(range(min = 0, max = 10))]
    pub severity: u8,

    #[validate(length(max = 128))]
    pub user: Option<String>,

    #[validate(length(max = 64))]
    pub src_ip: Option<String>,

    #[validate(length(max = 64))]
    pub dest_ip: Option<String>,

    #[validate(length(max = 256))]
    pub process_name: Option<String>,

    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

fn validate_event_type(value: &str) -> Result<(), ValidationError> {
    if value != EVENT_TYPE_V1 {
        return Err(ValidationError::new("unsupported_event_type"));
    }
    Ok(())
}

/// Immutable internal representation used by correlation and policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub source: String,
    pub host: String,
    pub category: String,
    pub action: String,
    pub severity: u8,
    pub timestamp_utc: DateTime<Utc>,
    pub received_time_utc: DateTime<Utc>,

    pub user: Option<String>,
    pub src_ip: Option<String>,
}

impl EventRecord {
    /// Normalise a validated wire event, stamping the gateway receive time.
    pub fn from_event(event: &SecurityEventV1, received_time_utc: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id.clone(),
            source: event.source.clone(),
            host: event.host.clone(),
            category: event.category.clone(),
            action: event.action.clone(),
            severity: event.severity,
            timestamp_utc: event.timestamp_utc,
            received_time_utc,
            user: event.user.clone(),
            src_ip: event.src_ip.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Throttle,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationDecision {
    pub event_id: String,
    pub host: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub event_id: String,
    pub host: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub context: Context,
}

/// Per-host policy state. Quarantine is sticky until externally cleared;
/// a past `cooldown_until_utc` is inert and only meaningful under a fresh
/// clock comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostPolicyState {
    pub cooldown_until_utc: Option<DateTime<Utc>>,
    pub quarantine: bool,
}
