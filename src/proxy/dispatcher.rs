//! The single entry point behind `/proxy`.
//!
//! A request moves through `Validating -> CacheLookup -> {hit | Fetching}`,
//! then `Rewriting` for playlists, then `Responding`. Any step can fail; the
//! error carries the client status and the stage is logged alongside it.
//! The dispatcher never retries; connect retries live in the origin fetcher.

use crate::{
    archive::ManifestArchive,
    cache::{CachedSegment, ManifestCache, SegmentCache},
    config::Config,
    error::{ProxyError, Result},
    hls::rewrite::rewrite_manifest,
    history::RouteHistory,
    inflight::{Flight, InFlight},
    metrics,
    origin::{ByteStream, FetchMode, Origin, OriginBody},
    proxy::{
        codec::{ProxyCodec, TARGET_PARAM},
        media,
        resolver::Resolver,
        tee::CachingStream,
    },
};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// What the routing layer hands to [`Dispatcher::resolve`].
#[derive(Debug, Default)]
pub struct ProxyRequest {
    /// Raw `url` parameter, if the client sent one
    pub target: Option<String>,
    /// Client request headers, forwarded to the origin for segments
    pub headers: HeaderMap,
    /// Query parameters appended to every rewritten reference served back
    pub reference_params: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

pub enum ProxyBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub content_type: String,
    /// Basename for `Content-Disposition`
    pub filename: String,
    pub cache: CacheStatus,
    pub content_length: Option<u64>,
    /// Origin headers relayed as-is (ranges, validators)
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

impl ProxyResponse {
    fn manifest(body: Bytes, filename: String, cache: CacheStatus) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: media::MANIFEST_CONTENT_TYPE.to_string(),
            filename,
            cache,
            content_length: Some(body.len() as u64),
            headers: HeaderMap::new(),
            body: ProxyBody::Full(body),
        }
    }

    fn cached_segment(segment: CachedSegment, filename: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: segment.content_type,
            filename,
            cache: CacheStatus::Hit,
            content_length: Some(segment.body.len() as u64),
            headers: HeaderMap::new(),
            body: ProxyBody::Full(segment.body),
        }
    }
}

/// Pipeline step a request failed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Fetching,
    Rewriting,
    Responding,
}

impl Stage {
    pub fn of(err: &ProxyError) -> Self {
        match err {
            ProxyError::MissingParameter(_)
            | ProxyError::InvalidReference(_)
            | ProxyError::DisallowedHost(_) => Stage::Validating,
            ProxyError::UpstreamUnavailable(_) | ProxyError::UpstreamError(_) => Stage::Fetching,
            ProxyError::ParseError(_) => Stage::Rewriting,
            ProxyError::Internal(_) => Stage::Responding,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Fetching => "fetching",
            Stage::Rewriting => "rewriting",
            Stage::Responding => "responding",
        }
    }
}

pub struct Dispatcher {
    resolver: Resolver,
    codec: ProxyCodec,
    origin: Arc<dyn Origin>,
    manifests: ManifestCache,
    segments: SegmentCache,
    inflight: InFlight,
    history: RouteHistory,
    archive: Option<ManifestArchive>,
    segment_max_entry_bytes: usize,
}

impl Dispatcher {
    pub fn new(config: &Config, origin: Arc<dyn Origin>, history: RouteHistory) -> Self {
        Self {
            resolver: Resolver::new(
                config.allowed_hosts.iter().cloned(),
                config.block_private_origins,
            ),
            codec: ProxyCodec::new(config.proxy_base_url.clone()),
            origin,
            manifests: ManifestCache::new(
                "manifest",
                config.manifest_cache_ttl(),
                config.manifest_cache_capacity,
            ),
            segments: SegmentCache::new(
                "segment",
                config.segment_cache_ttl(),
                config.segment_cache_capacity,
            ),
            inflight: InFlight::new(),
            history,
            archive: config.save_dir.clone().map(ManifestArchive::new),
            segment_max_entry_bytes: config.segment_cache_max_entry_bytes,
        }
    }

    /// Serve one proxy request.
    ///
    /// # Errors
    /// - [`ProxyError::MissingParameter`], [`ProxyError::InvalidReference`],
    ///   [`ProxyError::DisallowedHost`] while validating the target
    /// - [`ProxyError::UpstreamUnavailable`], [`ProxyError::UpstreamError`]
    ///   while fetching
    /// - [`ProxyError::ParseError`] while rewriting a playlist
    pub async fn resolve(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let result = self.run(request).await;

        if let Err(e) = &result {
            let stage = Stage::of(e);
            if e.status().is_server_error() {
                error!("Proxy request failed while {}: {}", stage.as_str(), e);
            } else {
                warn!("Proxy request rejected while {}: {}", stage.as_str(), e);
            }
        }

        result
    }

    async fn run(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let target = self.validate(request.target.as_deref())?;
        let key = target.as_str().to_string();
        let filename = media::basename(&target);

        if media::is_manifest_path(&target) {
            self.serve_manifest(&target, &key, filename, &request).await
        } else {
            self.serve_media(&target, &key, filename, &request).await
        }
    }

    /// Playlist response, with the request's reference parameters applied.
    /// Cached text never carries them.
    fn manifest_response(
        &self,
        body: Bytes,
        filename: String,
        cache: CacheStatus,
        request: &ProxyRequest,
    ) -> ProxyResponse {
        if request.reference_params.is_empty() {
            return ProxyResponse::manifest(body, filename, cache);
        }
        // Rewritten playlists are always valid UTF-8.
        let text = String::from_utf8_lossy(&body);
        let tagged = self
            .codec
            .append_params(&text, &request.reference_params);
        ProxyResponse::manifest(Bytes::from(tagged), filename, cache)
    }

    fn validate(&self, raw: Option<&str>) -> Result<Url> {
        let raw = raw
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(ProxyError::MissingParameter(TARGET_PARAM))?;

        self.resolver.resolve(raw, None)
    }

    /// Playlist path: cache, then a coalesced buffered fetch and rewrite.
    async fn serve_manifest(
        &self,
        target: &Url,
        key: &str,
        filename: String,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse> {
        let headers = &request.headers;
        if let Some(body) = self.manifests.get(key) {
            return Ok(self.manifest_response(body, filename, CacheStatus::Hit, request));
        }

        match self.inflight.join(key) {
            Flight::Leader(guard) => {
                // A previous leader may have finished between the lookup above
                // and taking the lead.
                if let Some(body) = self.manifests.get(key) {
                    return Ok(self.manifest_response(body, filename, CacheStatus::Hit, request));
                }
                let body = self.fetch_manifest(target, key, headers).await;
                drop(guard);
                Ok(self.manifest_response(body?, filename, CacheStatus::Miss, request))
            }
            Flight::Follower(follower) => {
                debug!("Waiting on in-flight fetch for {}", key);
                follower.wait().await;
                if let Some(body) = self.manifests.get(key) {
                    return Ok(self.manifest_response(body, filename, CacheStatus::Hit, request));
                }
                // The leader failed or its result was not cacheable.
                let body = self.fetch_manifest(target, key, headers).await?;
                Ok(self.manifest_response(body, filename, CacheStatus::Miss, request))
            }
        }
    }

    async fn fetch_manifest(&self, target: &Url, key: &str, headers: &HeaderMap) -> Result<Bytes> {
        let response = self
            .origin
            .fetch(target, FetchMode::Buffered, &manifest_request_headers(headers))
            .await?;

        if response.status == StatusCode::NOT_MODIFIED {
            return Err(ProxyError::UpstreamError(response.status.as_u16()));
        }

        let final_url = response.final_url.clone();
        let text = response.body.collect().await?;
        self.rewrite_and_store(target, key, &final_url, &text)
    }

    fn rewrite_and_store(
        &self,
        target: &Url,
        key: &str,
        final_url: &Url,
        text: &[u8],
    ) -> Result<Bytes> {
        let text = std::str::from_utf8(text)
            .map_err(|e| ProxyError::ParseError(format!("playlist is not UTF-8: {e}")))?;

        let output = rewrite_manifest(text, final_url, &self.resolver, &self.codec)?;
        metrics::record_rewritten_references(output.records.len());
        self.history.record(target.as_str(), &output.records);

        let body = Bytes::from(output.text);
        self.manifests.insert(key, body.clone());
        if let Some(archive) = &self.archive {
            archive.save(target, body.clone());
        }

        Ok(body)
    }

    /// Segment path: cache, then a streaming fetch relayed through the
    /// cache tee. A response declared as a playlist is rewritten instead.
    async fn serve_media(
        &self,
        target: &Url,
        key: &str,
        filename: String,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse> {
        let headers = &request.headers;
        let partial = headers.contains_key(header::RANGE);

        if !partial {
            if let Some(segment) = self.segments.get(key) {
                return Ok(ProxyResponse::cached_segment(segment, filename));
            }
            // Playlists without a playlist extension are cached here too.
            if let Some(body) = self.manifests.get(key) {
                return Ok(self.manifest_response(body, filename, CacheStatus::Hit, request));
            }
        }

        let response = self
            .origin
            .fetch(target, FetchMode::Streaming, headers)
            .await?;

        if response.status == StatusCode::OK
            && media::is_manifest_content_type(response.content_type())
        {
            info!("{} declared as playlist by origin, rewriting", target);
            let final_url = response.final_url.clone();
            let text = response.body.collect().await?;
            let body = self.rewrite_and_store(target, key, &final_url, &text)?;
            return Ok(self.manifest_response(body, filename, CacheStatus::Miss, request));
        }

        let content_type = media::segment_content_type(target, response.content_type());
        let content_length = response.content_length();
        let relayed = relayed_headers(&response.headers);
        // Only complete, unconditional 200 bodies are reusable.
        let cacheable = response.status == StatusCode::OK && !partial;

        let body = match response.body {
            OriginBody::Streaming(stream) if cacheable => ProxyBody::Stream(
                CachingStream::new(
                    stream,
                    self.segments.clone(),
                    key.to_string(),
                    content_type.clone(),
                    self.segment_max_entry_bytes,
                )
                .with_expected_len(content_length)
                .boxed(),
            ),
            OriginBody::Streaming(stream) => ProxyBody::Stream(stream),
            OriginBody::Buffered(bytes) => {
                if cacheable && bytes.len() <= self.segment_max_entry_bytes {
                    self.segments.insert(
                        key,
                        CachedSegment {
                            body: bytes.clone(),
                            content_type: content_type.clone(),
                        },
                    );
                }
                ProxyBody::Full(bytes)
            }
        };

        Ok(ProxyResponse {
            status: response.status,
            content_type,
            filename,
            cache: CacheStatus::Miss,
            content_length,
            headers: relayed,
            body,
        })
    }

    pub fn codec(&self) -> &ProxyCodec {
        &self.codec
    }

    pub fn manifest_cache_entries(&self) -> usize {
        self.manifests.len()
    }

    pub fn segment_cache_entries(&self) -> usize {
        self.segments.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.in_flight_count()
    }

    /// Drop expired entries from both caches. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.manifests.purge_expired() + self.segments.purge_expired()
    }
}

/// Playlists are rewritten, so origin validators and byte ranges do not
/// apply to what the client receives; always ask for the full body.
fn manifest_request_headers(client_headers: &HeaderMap) -> HeaderMap {
    let mut headers = client_headers.clone();
    for name in [
        header::RANGE,
        header::IF_RANGE,
        header::IF_NONE_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_MATCH,
        header::IF_UNMODIFIED_SINCE,
    ] {
        headers.remove(name);
    }
    headers
}

/// Origin response headers passed through on segment responses.
fn relayed_headers(origin_headers: &HeaderMap) -> HeaderMap {
    let relayed: [HeaderName; 5] = [
        header::ACCEPT_RANGES,
        header::CONTENT_RANGE,
        header::ETAG,
        header::LAST_MODIFIED,
        header::CACHE_CONTROL,
    ];

    let mut out = HeaderMap::new();
    for name in relayed {
        if let Some(value) = origin_headers.get(&name) {
            out.insert(name, value.clone());
        }
    }
    out
}
