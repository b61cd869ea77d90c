use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Transport-independent error taxonomy for the gateway.
///
/// Admission rejections carry the stable machine-readable tag returned to the
/// caller in the `detail` field; server faults collapse to opaque 5xx tags.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("validation rejected: {0}")]
    Validation(String),

    #[error("timestamp outside replay window")]
    Replay,

    #[error("duplicate event id")]
    Duplicate,

    #[error("rate limit exhausted")]
    RateLimited,

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable tag surfaced to the caller as `detail`.
    pub fn detail(&self) -> String {
        match self {
            GatewayError::Config(msg) => msg.clone(),
            GatewayError::Auth(reason) => reason.clone(),
            GatewayError::Validation(reason) => reason.clone(),
            GatewayError::Replay => "replay_window_exceeded".to_string(),
            GatewayError::Duplicate => "duplicate_event_id".to_string(),
            GatewayError::RateLimited => "rate_limited".to_string(),
            GatewayError::Persistence(_) => "persistence_error".to_string(),
            GatewayError::Serialization(_) => "serialization_error".to_string(),
            GatewayError::Io(_) => "io_error".to_string(),
            GatewayError::Internal(_) => "internal_error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Validation(_) | GatewayError::Replay => StatusCode::BAD_REQUEST,
            GatewayError::Duplicate => StatusCode::CONFLICT,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Config(_)
            | GatewayError::Persistence(_)
            | GatewayError::Serialization(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        GatewayError::Auth(reason.into())
    }

    pub fn validation<S: Into<String>>(reason: S) -> Self {
        GatewayError::Validation(reason.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        GatewayError::Internal(msg.into())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(json!({ "detail": self.detail() }));
        (status, body).into_response()
    }
}
