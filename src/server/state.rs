use crate::{
    config::Config,
    history::RouteHistory,
    metrics,
    origin::{HttpOrigin, Origin, RetryConfig},
    proxy::dispatcher::Dispatcher,
    server::rate_limit::RateLimiter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub history: RouteHistory,
    /// `None` when `RATE_LIMIT_RPM` is 0
    pub rate_limiter: Option<RateLimiter>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Build state with a pooled HTTP client as the origin.
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(config.request_timeout())
            .build()?;

        let origin = HttpOrigin::new(
            http_client,
            RetryConfig {
                max_attempts: config.origin_retry_attempts,
                timeout: config.request_timeout(),
                ..RetryConfig::default()
            },
        );

        Ok(Self::with_origin(config, Arc::new(origin)))
    }

    /// Build state around any [`Origin`] implementation.
    pub fn with_origin(config: Config, origin: Arc<dyn Origin>) -> Self {
        let history = RouteHistory::new(config.history_capacity);
        let dispatcher = Dispatcher::new(&config, origin, history.clone());
        let rate_limiter = (config.rate_limit_rpm > 0).then(|| RateLimiter::new(config.rate_limit_rpm));

        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            history,
            rate_limiter,
            metrics: metrics::init(),
            started_at: Instant::now(),
        }
    }
}
