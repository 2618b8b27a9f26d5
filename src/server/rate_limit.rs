//! Per-client fixed-window rate limiting.
//!
//! Counts requests per client address in one-minute windows. A client over
//! its budget gets `429` with a `Retry-After` until its window rolls over.

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::state::AppState;

#[derive(Clone, Debug)]
pub struct RateLimiter {
    /// (requests in window, window start) per client key
    windows: Arc<DashMap<String, (u32, Instant)>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_window(requests_per_minute, Duration::from_secs(60))
    }

    fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            limit,
            window,
        }
    }

    /// Count a request from `client`. On rejection, returns how long until
    /// the client's window resets.
    fn check(&self, client: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entry = self.windows.entry(client.to_string()).or_insert((0, now));
        let (count, started) = entry.value_mut();

        if started.elapsed() >= self.window {
            *count = 0;
            *started = now;
        }

        *count += 1;
        if *count <= self.limit {
            Ok(())
        } else {
            Err(self.window.saturating_sub(started.elapsed()))
        }
    }

    /// Drop windows that have rolled over. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, (_, started)| started.elapsed() < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
fn client_key(req: &Request) -> String {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let client = client_key(&req);
        if let Err(retry_after) = limiter.check(&client) {
            warn!("Rate limit exceeded for {}", client);
            let body = json!({
                "error": "rate_limited",
                "message": "Too many requests",
            });
            let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return resp;
        }
    }

    next.run(req).await
}
