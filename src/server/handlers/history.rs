use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

/// `GET /history?limit=N`: most recent rewrites first.
pub async fn list_history(
    Query(params): Query<HistoryParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let entries = state.history.recent(params.limit.unwrap_or(DEFAULT_LIMIT));
    Json(json!({
        "total": state.history.len(),
        "entries": entries,
    }))
}
