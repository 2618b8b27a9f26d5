use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default origin request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Default TTL for both caches in seconds.
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_MANIFEST_CACHE_CAPACITY: usize = 1_000;
const DEFAULT_SEGMENT_CACHE_CAPACITY: usize = 10_000;
/// Segments larger than this are relayed but not cached.
const DEFAULT_SEGMENT_MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Base that rewritten references point at, e.g. `https://relay.example/proxy`
    pub proxy_base_url: String,
    pub is_dev: bool,
    /// Whole-request timeout for origin fetches
    pub request_timeout_secs: u64,
    /// Total origin attempts when the connection cannot be established
    pub origin_retry_attempts: u32,
    pub manifest_cache_ttl_secs: u64,
    pub manifest_cache_capacity: usize,
    pub segment_cache_ttl_secs: u64,
    pub segment_cache_capacity: usize,
    pub segment_cache_max_entry_bytes: usize,
    /// Exact-match origin host allow-list; empty disables allow-listing
    pub allowed_hosts: Vec<String>,
    /// Reject private/reserved IP literals as origins
    pub block_private_origins: bool,
    /// Directory for archiving rewritten manifests
    pub save_dir: Option<PathBuf>,
    /// Maximum number of retained route history records
    pub history_capacity: usize,
    /// Requests per minute per client IP (0 = disabled)
    pub rate_limit_rpm: u32,
    /// Optional key required on `/proxy` and `/history`
    pub api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and
    /// PROXY_BASE_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port: u16 = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let proxy_base_url = if is_dev {
            env::var("PROXY_BASE_URL").unwrap_or_else(|_| format!("http://localhost:{port}/proxy"))
        } else {
            env::var("PROXY_BASE_URL").map_err(|_| "PROXY_BASE_URL is required in production")?
        };

        let allowed_hosts = env::var("ALLOWED_HOSTS")
            .map(|raw| parse_host_list(&raw))
            .unwrap_or_default();

        let save_dir = env::var("SAVE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let api_key = env::var("API_KEY").ok().filter(|s| !s.is_empty());

        Ok(Config {
            port,
            proxy_base_url,
            is_dev,
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS),
            origin_retry_attempts: parse_or("ORIGIN_RETRY_ATTEMPTS", 2),
            manifest_cache_ttl_secs: parse_or("MANIFEST_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            manifest_cache_capacity: parse_or(
                "MANIFEST_CACHE_CAPACITY",
                DEFAULT_MANIFEST_CACHE_CAPACITY,
            ),
            segment_cache_ttl_secs: parse_or("SEGMENT_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            segment_cache_capacity: parse_or(
                "SEGMENT_CACHE_CAPACITY",
                DEFAULT_SEGMENT_CACHE_CAPACITY,
            ),
            segment_cache_max_entry_bytes: parse_or(
                "SEGMENT_CACHE_MAX_ENTRY_BYTES",
                DEFAULT_SEGMENT_MAX_ENTRY_BYTES,
            ),
            allowed_hosts,
            block_private_origins: parse_or("BLOCK_PRIVATE_ORIGINS", true),
            save_dir,
            history_capacity: parse_or("HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY),
            rate_limit_rpm: parse_or("RATE_LIMIT_RPM", 0),
            api_key,
        })
    }

    /// Config with development defaults, independent of the environment.
    pub fn dev_defaults() -> Self {
        Config {
            port: 3000,
            proxy_base_url: "http://localhost:3000/proxy".to_string(),
            is_dev: true,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            origin_retry_attempts: 2,
            manifest_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            manifest_cache_capacity: DEFAULT_MANIFEST_CACHE_CAPACITY,
            segment_cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            segment_cache_capacity: DEFAULT_SEGMENT_CACHE_CAPACITY,
            segment_cache_max_entry_bytes: DEFAULT_SEGMENT_MAX_ENTRY_BYTES,
            allowed_hosts: Vec::new(),
            block_private_origins: true,
            save_dir: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            rate_limit_rpm: 0,
            api_key: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn manifest_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_cache_ttl_secs)
    }

    pub fn segment_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.segment_cache_ttl_secs)
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated host list, dropping blanks. Hosts are lowercased
/// to match what URL parsing produces.
fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}
