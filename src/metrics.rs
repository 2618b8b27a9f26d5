//! Prometheus metrics for the proxy pipeline.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder once per process and return its
/// render handle. Later calls reuse the first handle.
pub fn init() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                // Another recorder is already global; keep a detached one so
                // /metrics still renders.
                warn!("Prometheus recorder not installed: {}", e);
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// Count a finished request by endpoint and status.
pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "hls_relay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("hls_relay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(cache: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("hls_relay_cache_lookups_total", "cache" => cache, "result" => result).increment(1);
}

pub fn record_origin_error() {
    counter!("hls_relay_origin_errors_total").increment(1);
}

pub fn record_rewritten_references(count: usize) {
    counter!("hls_relay_rewritten_references_total").increment(count as u64);
}
