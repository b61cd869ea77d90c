use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{alerts, health, hosts, ingest};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/ingest", post(ingest::ingest))
        .route("/hosts/quarantined", get(hosts::list_quarantined))
        .route("/hosts/:host/state", get(hosts::get_state))
        .route("/hosts/:host/clear", post(hosts::clear_host))
        .route("/alerts/recent", get(alerts::recent))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(state)
}
