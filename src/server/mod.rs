pub mod api_key;
pub mod handlers;
pub mod rate_limit;
pub mod state;

use crate::config::Config;
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info};

pub const VERSION_HEADER: &str = "x-hls-relay-version";

/// How often expired cache entries and rate-limit windows are dropped.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Build the application router with all routes and middleware.
///
/// Public so integration tests can drive it without binding a port.
pub async fn build_router(config: Config) -> Result<Router, reqwest::Error> {
    let state = AppState::new(config)?;
    Ok(router(state))
}

/// Router over existing state.
///
/// Middleware runs outermost first: CORS, version header, rate limit, then
/// the API-key check on `/proxy` and `/history` only.
pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/proxy", get(handlers::proxy::serve_proxy))
        .route("/history", get(handlers::history::list_history))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_key::require_api_key,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render_metrics))
        .merge(gated)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::from_fn(version_header))
        .layer(cors)
        .with_state(state)
}

async fn version_header(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        HeaderName::from_static(VERSION_HEADER),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    resp
}

/// Periodically purge expired state until `cancel` fires.
fn spawn_housekeeping(state: AppState, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let entries = state.dispatcher.purge_expired();
                    let windows = state
                        .rate_limiter
                        .as_ref()
                        .map(|l| l.purge_expired())
                        .unwrap_or(0);
                    debug!(
                        "Housekeeping purged {} cache entries and {} rate-limit windows",
                        entries, windows
                    );
                }
            }
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    cancel.cancel();
}

/// Start the HTTP server and serve until a shutdown signal arrives.
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    info!("Proxy base URL: {}", config.proxy_base_url);
    if config.allowed_hosts.is_empty() {
        info!("Origin allow-list disabled");
    } else {
        info!("Origin allow-list: {}", config.allowed_hosts.join(", "));
    }
    if let Some(dir) = &config.save_dir {
        info!("Archiving rewritten playlists to {:?}", dir);
    }

    let state = AppState::new(config)?;
    let cancel = CancellationToken::new();
    spawn_housekeeping(state.clone(), cancel.clone());

    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel))
    .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}
