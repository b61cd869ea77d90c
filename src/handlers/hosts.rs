//! Host policy observability and the external quarantine-clear operation.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::state::AppState;

pub async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> Result<Json<Value>> {
    let host_state = state.policy.get_state(&host).await?;
    Ok(Json(json!({
        "host": host,
        "cooldown_until_utc": host_state.cooldown_until_utc,
        "quarantine": host_state.quarantine,
    })))
}

pub async fn list_quarantined(State(state): State<Arc<AppState>>) -> Result<Json<Value>> {
    let hosts = state.policy.list_quarantined().await?;
    Ok(Json(json!({ "hosts": hosts })))
}

pub async fn clear_host(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> Result<Json<Value>> {
    let host_state = state.policy.clear_host(&host).await?;
    state.audit.write(json!({
        "type": "host_policy_cleared",
        "host": host,
    }));
    Ok(Json(json!({
        "host": host,
        "cooldown_until_utc": host_state.cooldown_until_utc,
        "quarantine": host_state.quarantine,
    })))
}
