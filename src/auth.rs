//! Signature verification and anti-replay checks for the admission chain.
//!
//! Inbound requests carry `X-ARES-SIGNATURE: sha256=<hex>` where the hex is
//! the lower-case HMAC-SHA256 of the raw body bytes under the shared secret.

use chrono::{DateTime, Duration, Utc};
use ring::hmac;
use sha2::{Digest, Sha256};
use std::fmt::Write;

pub const SIG_HEADER: &str = "X-ARES-SIGNATURE";
pub const SIG_PREFIX: &str = "sha256=";

pub const REASON_MISSING: &str = "missing_signature";
pub const REASON_BAD_FORMAT: &str = "bad_signature_format";
pub const REASON_MISMATCH: &str = "signature_mismatch";

/// Lower-case hex HMAC-SHA256 over the raw body.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, body);
    hex_encode(tag.as_ref())
}

/// Check the signature header against the expected MAC. Comparison of the
/// hex strings is constant-time.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header_value: Option<&str>,
) -> Result<(), &'static str> {
    let header_value = match header_value {
        Some(v) => v,
        None => return Err(REASON_MISSING),
    };

    let provided = match header_value.strip_prefix(SIG_PREFIX) {
        Some(rest) => rest.trim(),
        None => return Err(REASON_BAD_FORMAT),
    };

    let expected = compute_signature(secret, body);
    ring::constant_time::verify_slices_are_equal(provided.as_bytes(), expected.as_bytes())
        .map_err(|_| REASON_MISMATCH)
}

/// SHA-256 of the raw body, hex-encoded; attached to every audit record so
/// rejected payloads can be tied back to what was actually received.
pub fn sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Events too far from gateway time are rejected. The delta is absolute, so
/// future-dated timestamps fail the same way as stale ones; a delta of
/// exactly the window still passes (rejection is strictly `>`).
pub fn within_replay_window(
    timestamp_utc: DateTime<Utc>,
    now: DateTime<Utc>,
    window_seconds: i64,
) -> bool {
    let delta = (now - timestamp_utc).abs();
    delta <= Duration::seconds(window_seconds)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        },
    )
}
