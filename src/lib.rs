//! HLS reverse proxy: fetches playlists and segments from an origin,
//! rewrites playlist references to route back through the proxy, and
//! caches both for a bounded time.

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod hls;
pub mod history;
pub mod inflight;
pub mod metrics;
pub mod origin;
pub mod proxy;
pub mod server;
