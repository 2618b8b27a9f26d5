use crate::{
    error::Result,
    metrics,
    proxy::{
        codec::TARGET_PARAM,
        dispatcher::{ProxyBody, ProxyRequest, ProxyResponse},
    },
    server::{api_key::API_KEY_PARAM, state::AppState},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// `GET /proxy?url=<absolute origin URL>`: rewritten playlist or relayed segment.
pub async fn serve_proxy(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    // A client that authenticated by query string keeps doing so on every
    // reference it follows.
    let reference_params = match (&state.config.api_key, params.contains_key(API_KEY_PARAM)) {
        (Some(key), true) => vec![(API_KEY_PARAM.to_string(), key.clone())],
        _ => Vec::new(),
    };
    let request = ProxyRequest {
        target: params.get(TARGET_PARAM).cloned(),
        headers,
        reference_params,
    };

    let result = state.dispatcher.resolve(request).await;
    let status = match &result {
        Ok(resp) => resp.status,
        Err(e) => e.status(),
    };
    metrics::record_request("proxy", status.as_u16());
    metrics::record_duration("proxy", start);

    let resp = result?;
    info!(
        "Served {} ({}, {}) in {:?}",
        resp.filename,
        resp.content_type,
        resp.cache.as_str(),
        start.elapsed()
    );
    Ok(resp.into_response())
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            ProxyBody::Full(bytes) => Body::from(bytes),
            ProxyBody::Stream(stream) => Body::from_stream(stream),
        };

        let mut resp = Response::new(body);
        *resp.status_mut() = self.status;

        let headers = resp.headers_mut();
        headers.extend(self.headers);
        if let Ok(value) = HeaderValue::from_str(&self.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(header::CONTENT_DISPOSITION, content_disposition(&self.filename));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static(self.cache.as_str()),
        );
        if let Some(len) = self.content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }

        resp
    }
}

fn content_disposition(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect();
    HeaderValue::from_str(&format!("inline; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("inline; filename=\"file\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_quotes_basename() {
        assert_eq!(
            content_disposition("seg0.ts"),
            "inline; filename=\"seg0.ts\""
        );
    }

    #[test]
    fn disposition_escapes_quotes() {
        assert_eq!(
            content_disposition("a\"b.ts"),
            "inline; filename=\"a_b.ts\""
        );
    }

    #[test]
    fn disposition_falls_back_on_invalid_header_text() {
        assert_eq!(
            content_disposition("bad\nname"),
            "inline; filename=\"file\""
        );
    }
}
