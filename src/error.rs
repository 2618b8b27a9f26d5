use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the proxy pipeline.
///
/// There is no cache variant: cache operations cannot fail a request.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Missing '{0}' parameter")]
    MissingParameter(&'static str),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Host not allowed: {0}")]
    DisallowedHost(String),

    #[error("Origin unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Origin responded with status {0}")]
    UpstreamError(u16),

    #[error("Failed to parse playlist: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingParameter(_) | ProxyError::InvalidReference(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::DisallowedHost(_) => StatusCode::FORBIDDEN,
            ProxyError::UpstreamUnavailable(_) | ProxyError::UpstreamError(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::ParseError(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            ProxyError::MissingParameter(_) => "missing_parameter",
            ProxyError::InvalidReference(_) => "invalid_reference",
            ProxyError::DisallowedHost(_) => "disallowed_host",
            ProxyError::UpstreamUnavailable(_) => "upstream_unavailable",
            ProxyError::UpstreamError(_) => "upstream_error",
            ProxyError::ParseError(_) => "parse_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Client-safe message. Upstream and internal causes stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ProxyError::UpstreamUnavailable(_) => "Origin could not be reached".to_string(),
            ProxyError::UpstreamError(status) => format!("Origin responded with status {status}"),
            ProxyError::ParseError(_) => "Origin playlist could not be parsed".to_string(),
            ProxyError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.reason(),
            "message": self.public_message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
