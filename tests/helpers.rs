use std::net::{TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use ares_gateway::auth::{compute_signature, SIG_PREFIX};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

pub struct TestServer {
    pub base: String,
    child: std::process::Child,
}

impl TestServer {
    pub fn shutdown(&mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

pub fn spawn_server(envs: Vec<(String, String)>) -> anyhow::Result<TestServer> {
    // Pick an ephemeral port by binding to 127.0.0.1:0 first
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut cmd = Command::new("cargo");
    cmd.arg("run")
        .arg("--bin")
        .arg("ares-gateway")
        .env("BIND_ADDR", format!("{}:{}", addr.ip(), addr.port()))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn()?;

    // Wait for TCP accept (lightweight readiness)
    let base = format!("http://{}", addr);
    let t0 = Instant::now();
    while t0.elapsed() < Duration::from_secs(30) {
        if TcpStream::connect(addr).is_ok() {
            return Ok(TestServer { base, child });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
    anyhow::bail!("server failed to start on {}", addr)
}

pub const TEST_SECRET: &str = "integration-secret";

/// Env bundle pointing all gateway outputs into `dir`.
pub fn gateway_env(dir: &std::path::Path) -> Vec<(String, String)> {
    vec![
        ("ARES_SHARED_SECRET".into(), TEST_SECRET.into()),
        (
            "ARES_PERSISTENT_STORE_PATH".into(),
            dir.join("state.db").display().to_string(),
        ),
        (
            "ARES_ALERT_PATH".into(),
            dir.join("alerts.jsonl").display().to_string(),
        ),
        (
            "ARES_AUDIT_PATH".into(),
            dir.join("audit.jsonl").display().to_string(),
        ),
    ]
}

#[allow(dead_code)]
pub fn event_body(event_id: &str, host: &str, action: &str, user: Option<&str>) -> Vec<u8> {
    event_body_with(event_id, host, action, user, None)
}

#[allow(dead_code)]
pub fn event_body_with(
    event_id: &str,
    host: &str,
    action: &str,
    user: Option<&str>,
    src_ip: Option<&str>,
) -> Vec<u8> {
    let mut payload = json!({
        "event_type": "sec.event.v1",
        "event_id": event_id,
        "source": "auth",
        "host": host,
        "timestamp_utc": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        "category": "auth",
        "action": action,
        "severity": 6,
    });
    if let Some(user) = user {
        payload["user"] = json!(user);
    }
    if let Some(src_ip) = src_ip {
        payload["src_ip"] = json!(src_ip);
    }
    serde_json::to_vec(&payload).unwrap()
}

#[allow(dead_code)]
pub fn signature_for(body: &[u8]) -> String {
    format!(
        "{SIG_PREFIX}{}",
        compute_signature(TEST_SECRET.as_bytes(), body)
    )
}

#[allow(dead_code)]
pub async fn post_signed(
    client: &reqwest::Client,
    base: &str,
    body: Vec<u8>,
) -> anyhow::Result<(u16, Value)> {
    let sig = signature_for(&body);
    let res = client
        .post(format!("{base}/ingest"))
        .header("content-type", "application/json")
        .header("X-ARES-SIGNATURE", sig)
        .body(body)
        .send()
        .await?;
    let status = res.status().as_u16();
    let value = res.json().await?;
    Ok((status, value))
}
