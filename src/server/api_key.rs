//! Optional shared-key gate for `/proxy` and `/history`.

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;
use url::form_urlencoded;

use super::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_PARAM: &str = "api_key";

/// Key from the `X-Api-Key` header, else the `api_key` query parameter.
fn supplied_key(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = value.to_str()
    {
        return Some(value.to_string());
    }

    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == API_KEY_PARAM)
        .map(|(_, v)| v.into_owned())
}

/// Passes through when no key is configured; otherwise rejects with `401`
/// unless the request carries the configured key. An accepted key header is
/// removed so it never reaches an origin.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.config.api_key.as_deref() {
        match supplied_key(&req) {
            Some(key) if key == expected => {}
            supplied => {
                warn!(
                    "Rejected {} request to {}",
                    if supplied.is_some() { "wrong-key" } else { "keyless" },
                    req.uri().path()
                );
                let body = json!({
                    "error": "unauthorized",
                    "message": "A valid API key is required",
                });
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
        }
        req.headers_mut().remove(API_KEY_HEADER);
    }

    next.run(req).await
}
