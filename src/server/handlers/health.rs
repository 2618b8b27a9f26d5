use crate::server::state::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

/// `GET /` and `GET /health`
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "manifest_cache_entries": dispatcher.manifest_cache_entries(),
        "segment_cache_entries": dispatcher.segment_cache_entries(),
        "in_flight_fetches": dispatcher.in_flight(),
    }))
}
