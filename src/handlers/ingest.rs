//! `POST /ingest`: the ordered admission chain followed by correlation,
//! policy enforcement, and alert emission. Any admission step may
//! short-circuit with a rejection, which is itself audited.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use validator::Validate;

use crate::alert;
use crate::auth;
use crate::error::{GatewayError, Result};
use crate::models::{EventRecord, SecurityEventV1};
use crate::state::AppState;

const INGEST_PATH: &str = "/ingest";

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let client_ip = addr.ip().to_string();
    let body_hash = auth::sha256_hex(&body);

    // 1) Verify signature on raw bytes. A missing secret is a server fault,
    //    not a client rejection.
    let secret = state.config.shared_secret.as_str();
    if secret.is_empty() {
        state.audit.write(json!({
            "type": "server_error",
            "path": INGEST_PATH,
            "client_ip": client_ip,
            "error": "shared_secret_not_configured",
        }));
        return Err(GatewayError::config("shared_secret_not_configured"));
    }

    let sig_header = headers
        .get(auth::SIG_HEADER)
        .and_then(|v| v.to_str().ok());
    if let Err(reason) = auth::verify_signature(secret.as_bytes(), &body, sig_header) {
        reject(&state, &client_ip, &body_hash, reason, None, None);
        return Err(GatewayError::auth(reason));
    }

    // 2) Parse JSON, then validate the schema.
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            reject(&state, &client_ip, &body_hash, "invalid_json", None, None);
            return Err(GatewayError::validation("invalid_json"));
        }
    };
    let event: SecurityEventV1 = match serde_json::from_value(payload) {
        Ok(e) => e,
        Err(e) => {
            reject(
                &state,
                &client_ip,
                &body_hash,
                "schema_validation_failed",
                None,
                Some(e.to_string()),
            );
            return Err(GatewayError::validation("schema_validation_failed"));
        }
    };
    if let Err(e) = event.validate() {
        reject(
            &state,
            &client_ip,
            &body_hash,
            "schema_validation_failed",
            Some(&event),
            Some(e.to_string()),
        );
        return Err(GatewayError::validation("schema_validation_failed"));
    }

    // 3) Anti-replay window on the producer timestamp.
    let now = Utc::now();
    if !auth::within_replay_window(event.timestamp_utc, now, state.config.replay_window_seconds) {
        reject(
            &state,
            &client_ip,
            &body_hash,
            "replay_window_exceeded",
            Some(&event),
            None,
        );
        return Err(GatewayError::Replay);
    }

    // 4) Idempotency.
    let seen = state
        .idempotency
        .seen(&event.event_id)
        .await
        .map_err(|e| server_fault(&state, &client_ip, &body_hash, e))?;
    if seen {
        reject(
            &state,
            &client_ip,
            &body_hash,
            "duplicate_event_id",
            Some(&event),
            None,
        );
        return Err(GatewayError::Duplicate);
    }

    // 5) Rate limit per host.
    if !state.rate_limiter.allow(&event.host) {
        reject(
            &state,
            &client_ip,
            &body_hash,
            "rate_limited",
            Some(&event),
            None,
        );
        return Err(GatewayError::RateLimited);
    }

    // Mark idempotency only once every admission check has passed, so a
    // rate-limited event may legitimately be retried under the same id.
    state
        .idempotency
        .mark(&event.event_id)
        .await
        .map_err(|e| server_fault(&state, &client_ip, &body_hash, e))?;
    state.idempotency.maybe_gc().await;

    // Correlation over the host's rolling history.
    let record = EventRecord::from_event(&event, Utc::now());
    let corr = state.correlator.evaluate(&record);

    // Final decision from the host policy state machine.
    let policy = state
        .policy
        .evaluate(&record, &corr)
        .await
        .map_err(|e| server_fault(&state, &client_ip, &body_hash, e))?
        .into_decision();

    // Alert emission, deduplicated per (rule, host, user, src_ip).
    for reason in &corr.reasons {
        let Some(rule) = alert::rule_for_reason(reason) else {
            continue;
        };
        if !state.deduper.should_emit(
            rule.rule_id,
            &record.host,
            record.user.as_deref(),
            record.src_ip.as_deref(),
        ) {
            continue;
        }
        let alert = alert::build_alert(rule, &record, reason, corr.context.clone());
        state.alerts.emit(&alert);
        state.audit.write(json!({
            "type": "alert_emitted",
            "alert_id": alert.alert_id,
            "rule_id": alert.rule_id,
            "event_id": record.event_id,
            "host": record.host,
            "user": record.user,
            "src_ip": record.src_ip,
        }));
    }

    state.audit.write(json!({
        "type": "gateway_accept",
        "path": INGEST_PATH,
        "client_ip": client_ip,
        "verification_status": "pass",
        "verification_reason": "ok",
        "body_sha256": body_hash,
        "event_id": event.event_id,
        "host": event.host,
        "category": event.category,
        "action": event.action,
        "severity": event.severity,
    }));
    state.audit.write(json!({
        "type": "correlation_decision",
        "event_id": corr.event_id,
        "host": corr.host,
        "decision": corr.decision,
        "reasons": corr.reasons,
        "context": corr.context,
        "client_ip": client_ip,
        "body_sha256": body_hash,
    }));
    state.audit.write(json!({
        "type": "policy_decision",
        "event_id": policy.event_id,
        "host": policy.host,
        "decision": policy.decision,
        "reasons": policy.reasons,
        "context": policy.context,
    }));

    Ok(Json(json!({
        "accepted": true,
        "event_id": event.event_id,
        "gateway_reason": "ok",
        "correlation": {
            "decision": corr.decision,
            "reasons": corr.reasons,
            "context": corr.context,
        },
        "policy": {
            "decision": policy.decision,
            "reasons": policy.reasons,
            "context": policy.context,
        },
        "final_decision": policy.decision,
    })))
}

fn reject(
    state: &AppState,
    client_ip: &str,
    body_hash: &str,
    reason: &str,
    event: Option<&SecurityEventV1>,
    error: Option<String>,
) {
    let mut record = serde_json::Map::new();
    record.insert("type".into(), json!("gateway_reject"));
    record.insert("path".into(), json!(INGEST_PATH));
    record.insert("client_ip".into(), json!(client_ip));
    record.insert("verification_status".into(), json!("fail"));
    record.insert("verification_reason".into(), json!(reason));
    record.insert("body_sha256".into(), json!(body_hash));
    if let Some(event) = event {
        record.insert("event_id".into(), json!(event.event_id));
        record.insert("host".into(), json!(event.host));
        record.insert("category".into(), json!(event.category));
        record.insert("action".into(), json!(event.action));
    }
    if let Some(error) = error {
        record.insert("error".into(), json!(error));
    }
    state.audit.write(Value::Object(record));
}

fn server_fault(
    state: &AppState,
    client_ip: &str,
    body_hash: &str,
    error: GatewayError,
) -> GatewayError {
    state.audit.write(json!({
        "type": "server_error",
        "path": INGEST_PATH,
        "client_ip": client_ip,
        "body_sha256": body_hash,
        "error": error.to_string(),
    }));
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use chrono::{Duration, SecondsFormat};

    const SECRET: &str = "test-secret";

    async fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let config = GatewayConfig {
            shared_secret: SECRET.to_string(),
            use_persistent_store: false,
            alert_path: dir.path().join("alerts.jsonl"),
            audit_path: dir.path().join("audit.jsonl"),
            ..GatewayConfig::default()
        };
        AppState::new(config).await.unwrap()
    }

    fn caller() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 45000)))
    }

    fn event_payload(event_id: &str, host: &str, action: &str, user: Option<&str>) -> Value {
        let mut payload = json!({
            "event_type": "sec.event.v1",
            "event_id": event_id,
            "source": "auth",
            "host": host,
            "timestamp_utc": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "category": "auth",
            "action": action,
            "severity": 5,
        });
        if let Some(user) = user {
            payload["user"] = json!(user);
        }
        payload
    }

    fn sig_header_name() -> axum::http::HeaderName {
        axum::http::HeaderName::from_bytes(auth::SIG_HEADER.as_bytes()).unwrap()
    }

    fn signed(payload: &Value) -> (HeaderMap, Bytes) {
        let body = serde_json::to_vec(payload).unwrap();
        let sig = auth::compute_signature(SECRET.as_bytes(), &body);
        let mut headers = HeaderMap::new();
        headers.insert(
            sig_header_name(),
            format!("{}{sig}", auth::SIG_PREFIX).parse().unwrap(),
        );
        (headers, Bytes::from(body))
    }

    async fn post(state: &Arc<AppState>, headers: HeaderMap, body: Bytes) -> Result<Json<Value>> {
        ingest(State(state.clone()), caller(), headers, body).await
    }

    fn audit_lines(dir: &tempfile::TempDir) -> Vec<Value> {
        let data = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap_or_default();
        data.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn alert_lines(dir: &tempfile::TempDir) -> Vec<Value> {
        let data = std::fs::read_to_string(dir.path().join("alerts.jsonl")).unwrap_or_default();
        data.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn accepted_event_returns_decision_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let (headers, body) = signed(&event_payload("evt-00000001", "h1", "login_failed", None));

        let Json(response) = post(&state, headers, body).await.unwrap();
        assert_eq!(response["accepted"], true);
        assert_eq!(response["event_id"], "evt-00000001");
        assert_eq!(response["gateway_reason"], "ok");
        assert_eq!(response["correlation"]["decision"], "ALLOW");
        assert_eq!(response["policy"]["decision"], "ALLOW");
        assert_eq!(response["final_decision"], response["policy"]["decision"]);

        let audits = audit_lines(&dir);
        let kinds: Vec<&str> = audits.iter().map(|a| a["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["gateway_accept", "correlation_decision", "policy_decision"]
        );
        assert!(audits.iter().all(|a| a["received_time_utc"].is_string()));
    }

    #[tokio::test]
    async fn missing_secret_is_a_server_fault() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            shared_secret: String::new(),
            use_persistent_store: false,
            alert_path: dir.path().join("alerts.jsonl"),
            audit_path: dir.path().join("audit.jsonl"),
            ..GatewayConfig::default()
        };
        let state = AppState::new(config).await.unwrap();
        let (headers, body) = signed(&event_payload("evt-00000001", "h1", "login_failed", None));

        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        // Audited as a server error, not as a gateway reject.
        let audits = audit_lines(&dir);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0]["type"], "server_error");
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_and_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let payload = event_payload("evt-00000001", "h1", "login_failed", None);
        let (headers, body) = signed(&payload);

        // Flip one hex digit of the signature.
        let good = headers[auth::SIG_HEADER].to_str().unwrap().to_string();
        let mut tampered = good.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });
        let mut bad_headers = HeaderMap::new();
        bad_headers.insert(sig_header_name(), tampered.parse().unwrap());

        let err = post(&state, bad_headers, body.clone()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(ref r) if r == "signature_mismatch"));

        let audits = audit_lines(&dir);
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0]["type"], "gateway_reject");
        assert_eq!(audits[0]["verification_reason"], "signature_mismatch");
        assert_eq!(audits[0]["body_sha256"], auth::sha256_hex(&body));

        // The id was never marked: a correctly signed retry is accepted.
        assert!(!state.idempotency.seen("evt-00000001").await.unwrap());
        let (headers, body) = signed(&payload);
        assert!(post(&state, headers, body).await.is_ok());
    }

    #[tokio::test]
    async fn missing_and_malformed_signature_headers() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let (_, body) = signed(&event_payload("evt-00000001", "h1", "login_failed", None));

        let err = post(&state, HeaderMap::new(), body.clone()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(ref r) if r == "missing_signature"));

        let mut headers = HeaderMap::new();
        headers.insert(sig_header_name(), "md5=abcdef".parse().unwrap());
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(ref r) if r == "bad_signature_format"));
    }

    #[tokio::test]
    async fn invalid_json_and_schema_violations() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        // Signed garbage: passes signature, fails parse.
        let body = Bytes::from_static(b"not json at all");
        let sig = auth::compute_signature(SECRET.as_bytes(), &body);
        let mut headers = HeaderMap::new();
        headers.insert(
            sig_header_name(),
            format!("{}{sig}", auth::SIG_PREFIX).parse().unwrap(),
        );
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref r) if r == "invalid_json"));

        // Unknown top-level field.
        let mut payload = event_payload("evt-00000001", "h1", "login_failed", None);
        payload["surprise"] = json!(true);
        let (headers, body) = signed(&payload);
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref r) if r == "schema_validation_failed"));

        // Field constraint violation caught post-parse.
        let mut payload = event_payload("evt-00000001", "h1", "login_failed", None);
        payload["event_id"] = json!("short");
        let (headers, body) = signed(&payload);
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(ref r) if r == "schema_validation_failed"));
    }

    #[tokio::test]
    async fn stale_and_future_timestamps_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let mut payload = event_payload("evt-00000001", "h1", "login_failed", None);
        payload["timestamp_utc"] = json!((Utc::now() - Duration::seconds(9999))
            .to_rfc3339_opts(SecondsFormat::Micros, true));
        let (headers, body) = signed(&payload);
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Replay));

        let mut payload = event_payload("evt-00000002", "h1", "login_failed", None);
        payload["timestamp_utc"] = json!((Utc::now() + Duration::seconds(9999))
            .to_rfc3339_opts(SecondsFormat::Micros, true));
        let (headers, body) = signed(&payload);
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::Replay));

        let audits = audit_lines(&dir);
        assert!(audits
            .iter()
            .all(|a| a["verification_reason"] == "replay_window_exceeded"));
        // Rejected events carry the fields already known at that point.
        assert_eq!(audits[0]["event_id"], "evt-00000001");
        assert_eq!(audits[0]["host"], "h1");
    }

    #[tokio::test]
    async fn duplicate_event_id_conflicts_with_identical_audit_shape() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let payload = event_payload("evt-00000001", "h1", "login_failed", None);

        let (headers, body) = signed(&payload);
        post(&state, headers, body).await.unwrap();

        for _ in 0..2 {
            let (headers, body) = signed(&payload);
            let err = post(&state, headers, body).await.unwrap_err();
            assert!(matches!(err, GatewayError::Duplicate));
        }

        let rejects: Vec<Value> = audit_lines(&dir)
            .into_iter()
            .filter(|a| a["type"] == "gateway_reject")
            .collect();
        assert_eq!(rejects.len(), 2);
        for r in &rejects {
            assert_eq!(r["verification_reason"], "duplicate_event_id");
            assert_eq!(r["event_id"], "evt-00000001");
        }
        // Duplicates produce no correlation, policy, or alert records.
        let decisions = audit_lines(&dir)
            .iter()
            .filter(|a| a["type"] == "correlation_decision" || a["type"] == "policy_decision")
            .count();
        assert_eq!(decisions, 2);
        assert!(alert_lines(&dir).is_empty());
    }

    #[tokio::test]
    async fn rate_limited_event_is_not_marked_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            shared_secret: SECRET.to_string(),
            use_persistent_store: false,
            rate_limit_per_minute: 2,
            alert_path: dir.path().join("alerts.jsonl"),
            audit_path: dir.path().join("audit.jsonl"),
            ..GatewayConfig::default()
        };
        let state = AppState::new(config).await.unwrap();

        for i in 0..2 {
            let (headers, body) = signed(&event_payload(
                &format!("evt-0000000{i}"),
                "h1",
                "login_failed",
                None,
            ));
            post(&state, headers, body).await.unwrap();
        }

        let (headers, body) = signed(&event_payload("evt-00000009", "h1", "login_failed", None));
        let err = post(&state, headers, body).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));
        // Marking happens after the rate limit, so a retry stays legitimate.
        assert!(!state.idempotency.seen("evt-00000009").await.unwrap());
        // Other hosts still have budget.
        let (headers, body) = signed(&event_payload("evt-00000010", "h2", "login_failed", None));
        post(&state, headers, body).await.unwrap();
    }

    #[tokio::test]
    async fn brute_force_quarantines_host_and_emits_one_alert() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        for i in 0..7 {
            let (headers, body) = signed(&event_payload(
                &format!("evt-bf-{i:04}"),
                "h1",
                "login_failed",
                Some("alice"),
            ));
            let Json(response) = post(&state, headers, body).await.unwrap();
            assert_eq!(response["final_decision"], "ALLOW", "event {i}");
        }

        let (headers, body) = signed(&event_payload(
            "evt-bf-0007",
            "h1",
            "login_failed",
            Some("alice"),
        ));
        let Json(response) = post(&state, headers, body).await.unwrap();
        assert!(response["correlation"]["reasons"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r == "brute_force_suspected"));
        assert_eq!(response["policy"]["decision"], "BLOCK");
        assert_eq!(
            response["policy"]["reasons"],
            json!(["quarantine_activated"])
        );
        assert_eq!(response["final_decision"], "BLOCK");

        // Host is now sticky-blocked.
        let (headers, body) = signed(&event_payload(
            "evt-bf-0008",
            "h1",
            "login_failed",
            Some("alice"),
        ));
        let Json(response) = post(&state, headers, body).await.unwrap();
        assert_eq!(response["policy"]["reasons"], json!(["host_quarantined"]));

        assert!(state.policy.get_state("h1").await.unwrap().quarantine);

        // Exactly one alert within the dedupe window, despite repeat firings.
        let alerts = alert_lines(&dir);
        let brute: Vec<&Value> = alerts
            .iter()
            .filter(|a| a["rule_id"] == "BRUTE_FORCE_V1")
            .collect();
        assert_eq!(brute.len(), 1);
        assert_eq!(brute[0]["host"], "h1");
        assert_eq!(brute[0]["user"], "alice");
        assert_eq!(brute[0]["reasons"], json!(["brute_force_suspected"]));
    }

    #[tokio::test]
    async fn success_after_failures_emits_dedicated_alert() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        for i in 0..6 {
            let (headers, body) = signed(&event_payload(
                &format!("evt-sf-{i:04}"),
                "h3",
                "login_failed",
                Some("bob"),
            ));
            post(&state, headers, body).await.unwrap();
        }
        let (headers, body) = signed(&event_payload(
            "evt-sf-0006",
            "h3",
            "login_success",
            Some("bob"),
        ));
        let Json(response) = post(&state, headers, body).await.unwrap();
        assert!(response["correlation"]["reasons"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r == "success_after_failures"));
        assert_eq!(response["final_decision"], "THROTTLE");

        let alerts = alert_lines(&dir);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["rule_id"], "SUCCESS_AFTER_FAILURES_V1");
        assert_eq!(alerts[0]["user"], "bob");
    }
}
