use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration, sourced from `ARES_*` environment variables with
/// safe defaults. The shared secret is intentionally allowed to be empty at
/// startup; ingest requests fail with a server fault until it is set.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub shared_secret: String,

    pub replay_window_seconds: i64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_window_seconds: i64,

    pub cooldown_seconds: i64,
    pub severity_floor: u8,
    pub quarantine_on: Vec<String>,

    pub alert_dedup_seconds: i64,
    pub idempotency_ttl_seconds: i64,

    pub use_persistent_store: bool,
    pub persistent_store_path: PathBuf,
    pub alert_path: PathBuf,
    pub audit_path: PathBuf,

    pub correlation: CorrelationConfig,
}

/// Windows and thresholds for the correlation rule set.
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub store_window_seconds: i64,

    pub storm_window_seconds: i64,
    pub storm_threshold: usize,

    pub brute_window_seconds: i64,
    pub brute_threshold: usize,

    pub spray_window_seconds: i64,
    pub spray_fail_threshold: usize,
    pub spray_unique_users_threshold: usize,

    pub success_window_seconds: i64,
    pub success_prior_fail_threshold: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            store_window_seconds: 900,
            storm_window_seconds: 30,
            storm_threshold: 50,
            brute_window_seconds: 60,
            brute_threshold: 8,
            spray_window_seconds: 120,
            spray_fail_threshold: 8,
            spray_unique_users_threshold: 5,
            success_window_seconds: 600,
            success_prior_fail_threshold: 6,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            replay_window_seconds: 120,
            rate_limit_per_minute: 300,
            rate_limit_window_seconds: 60,
            cooldown_seconds: 120,
            severity_floor: 0,
            quarantine_on: vec!["brute_force_suspected".to_string()],
            alert_dedup_seconds: 300,
            idempotency_ttl_seconds: 7 * 24 * 3600,
            use_persistent_store: true,
            persistent_store_path: PathBuf::from("out/state.db"),
            alert_path: PathBuf::from("out/alerts.jsonl"),
            audit_path: PathBuf::from("out/audit.jsonl"),
            correlation: CorrelationConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shared_secret: std::env::var("ARES_SHARED_SECRET").unwrap_or_default(),
            replay_window_seconds: env_parse(
                "ARES_REPLAY_WINDOW_SECONDS",
                defaults.replay_window_seconds,
            ),
            rate_limit_per_minute: env_parse(
                "ARES_RATE_LIMIT_PER_MIN",
                defaults.rate_limit_per_minute,
            ),
            rate_limit_window_seconds: defaults.rate_limit_window_seconds,
            cooldown_seconds: env_parse("ARES_COOLDOWN_SECONDS", defaults.cooldown_seconds),
            severity_floor: env_parse("ARES_SEVERITY_FLOOR", defaults.severity_floor),
            quarantine_on: env_list("ARES_QUARANTINE_ON", defaults.quarantine_on),
            alert_dedup_seconds: env_parse(
                "ARES_ALERT_DEDUP_SECONDS",
                defaults.alert_dedup_seconds,
            ),
            idempotency_ttl_seconds: env_parse(
                "ARES_IDEMPOTENCY_TTL_SECONDS",
                defaults.idempotency_ttl_seconds,
            ),
            use_persistent_store: env_flag(
                "ARES_USE_PERSISTENT_STORE",
                defaults.use_persistent_store,
            ),
            persistent_store_path: env_path(
                "ARES_PERSISTENT_STORE_PATH",
                defaults.persistent_store_path,
            ),
            alert_path: env_path("ARES_ALERT_PATH", defaults.alert_path),
            audit_path: env_path("ARES_AUDIT_PATH", defaults.audit_path),
            correlation: CorrelationConfig::from_env(),
        }
    }
}

impl CorrelationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            store_window_seconds: env_parse("ARES_STORE_WINDOW_SECONDS", d.store_window_seconds),
            storm_window_seconds: env_parse("ARES_STORM_WINDOW_SECONDS", d.storm_window_seconds),
            storm_threshold: env_parse("ARES_STORM_THRESHOLD", d.storm_threshold),
            brute_window_seconds: env_parse("ARES_BRUTE_WINDOW_SECONDS", d.brute_window_seconds),
            brute_threshold: env_parse("ARES_BRUTE_THRESHOLD", d.brute_threshold),
            spray_window_seconds: env_parse("ARES_SPRAY_WINDOW_SECONDS", d.spray_window_seconds),
            spray_fail_threshold: env_parse("ARES_SPRAY_FAIL_THRESHOLD", d.spray_fail_threshold),
            spray_unique_users_threshold: env_parse(
                "ARES_SPRAY_UNIQUE_USERS",
                d.spray_unique_users_threshold,
            ),
            success_window_seconds: env_parse(
                "ARES_SUCCESS_WINDOW_SECONDS",
                d.success_window_seconds,
            ),
            success_prior_fail_threshold: env_parse(
                "ARES_SUCCESS_PRIOR_FAILS",
                d.success_prior_fail_threshold,
            ),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}
