//! Origin fetching with a whole-request timeout, header forwarding and a
//! choice between buffered and streaming bodies.
//!
//! Connection setup failures are retried with a fixed backoff; anything the
//! origin actually answered is never retried.

use crate::{
    error::{ProxyError, Result},
    metrics,
};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::Client;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Default number of attempts when the connection cannot be established.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Default whole-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for origin fetches.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
    /// Timeout for the whole request, body included.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// Read the whole body before returning (manifests)
    Buffered,
    /// Return a single-pass chunk stream (segments)
    Streaming,
}

pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

pub enum OriginBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl std::fmt::Debug for OriginBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            OriginBody::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

impl OriginBody {
    /// Drain the body into memory.
    pub async fn collect(self) -> Result<Bytes> {
        match self {
            OriginBody::Buffered(bytes) => Ok(bytes),
            OriginBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| ProxyError::UpstreamUnavailable(e.to_string()))?;
                    buf.extend_from_slice(&chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

#[derive(Debug)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL the origin answered from after following redirects
    pub final_url: Url,
    pub body: OriginBody,
}

impl OriginResponse {
    /// Declared media type, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
            .filter(|v| !v.is_empty())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// The `GET target` capability the dispatcher consumes.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch `target`.
    ///
    /// # Errors
    /// - [`ProxyError::UpstreamUnavailable`] on timeout or connection failure
    /// - [`ProxyError::UpstreamError`] when the origin answers with a non-2xx
    ///   status other than `304 Not Modified`
    async fn fetch(
        &self,
        target: &Url,
        mode: FetchMode,
        forwarded_headers: &HeaderMap,
    ) -> Result<OriginResponse>;
}

/// [`Origin`] backed by a pooled `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpOrigin {
    client: Client,
    config: RetryConfig,
}

impl HttpOrigin {
    pub fn new(client: Client, config: RetryConfig) -> Self {
        Self { client, config }
    }

    async fn send(&self, target: &Url, headers: &HeaderMap) -> Result<reqwest::Response> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let request = self
                .client
                .get(target.clone())
                .headers(headers.clone())
                .timeout(self.config.timeout);

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < max_attempts => {
                    warn!(
                        "Origin connect failed for {} (attempt {}/{}): {}",
                        target, attempt, max_attempts, e
                    );
                    tokio::time::sleep(self.config.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "Origin fetch failed for {} (attempt {}/{}): {}",
                        target, attempt, max_attempts, e
                    );
                    metrics::record_origin_error();
                    return Err(ProxyError::UpstreamUnavailable(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(
        &self,
        target: &Url,
        mode: FetchMode,
        forwarded_headers: &HeaderMap,
    ) -> Result<OriginResponse> {
        let headers = forwardable_headers(forwarded_headers);
        let response = self.send(target, &headers).await?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            warn!("Origin returned {} for {}", status, target);
            metrics::record_origin_error();
            return Err(ProxyError::UpstreamError(status.as_u16()));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let body = match mode {
            FetchMode::Buffered => {
                let bytes = response.bytes().await.map_err(|e| {
                    warn!("Origin body read failed for {}: {}", target, e);
                    metrics::record_origin_error();
                    ProxyError::UpstreamUnavailable(e.to_string())
                })?;
                OriginBody::Buffered(bytes)
            }
            FetchMode::Streaming => OriginBody::Streaming(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other))
                    .boxed(),
            ),
        };

        Ok(OriginResponse {
            status,
            headers,
            final_url,
            body,
        })
    }
}

/// Client request headers minus host, hop-by-hop headers and
/// `accept-encoding`. Origin bodies arrive uncompressed.
pub fn forwardable_headers(client_headers: &HeaderMap) -> HeaderMap {
    let not_forwarded: [HeaderName; 11] = [
        header::HOST,
        header::CONNECTION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::PROXY_AUTHORIZATION,
        header::CONTENT_LENGTH,
        header::ACCEPT_ENCODING,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
    ];

    let mut headers = client_headers.clone();
    for name in &not_forwarded {
        headers.remove(name);
    }
    headers
}
