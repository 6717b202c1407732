//! HTTP surface: the analyze endpoint plus a liveness probe.

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

pub mod analyze;

/// Server version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the router over the shared state.
#[must_use]
pub fn router(state: AppState) -> Router {
    let body_limit = analyze::transport_body_limit(&state.config.imaging);

    Router::new()
        .route("/analyze", post(analyze::analyze))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "uptimeSecs": state.uptime_secs(),
    }))
}
