use crate::error::{ProxyError, Result};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Turns client-supplied and manifest-internal references into absolute
/// origin URLs, enforcing the host allow-list.
///
/// Pure: the result depends only on the inputs and the configured policy.
#[derive(Clone, Debug, Default)]
pub struct Resolver {
    /// Exact-match host set. Empty disables allow-listing.
    allowed_hosts: HashSet<String>,
    /// Reject IP literals in private/reserved ranges (SSRF protection)
    block_private: bool,
}

impl Resolver {
    pub fn new<I, S>(allowed_hosts: I, block_private: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_hosts: allowed_hosts.into_iter().map(Into::into).collect(),
            block_private,
        }
    }

    /// Resolve `raw` to an absolute http(s) URL.
    ///
    /// Without a `base` the reference must already be absolute. With a base
    /// (the manifest's final URL), relative references are joined onto it.
    ///
    /// # Errors
    /// - [`ProxyError::InvalidReference`] if the result has no http(s) scheme or no host
    /// - [`ProxyError::DisallowedHost`] if the host fails the allow-list or the
    ///   private-address guard
    pub fn resolve(&self, raw: &str, base: Option<&Url>) -> Result<Url> {
        let url = absolutize(raw, base)?;
        let host = url.host_str().unwrap_or_default();

        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.contains(host) {
            return Err(ProxyError::DisallowedHost(host.to_string()));
        }

        if self.block_private {
            match url.host() {
                Some(Host::Ipv4(ip)) if is_blocked_ipv4(ip) => {
                    return Err(ProxyError::DisallowedHost(ip.to_string()));
                }
                Some(Host::Ipv6(ip)) if is_blocked_ipv6(ip) => {
                    return Err(ProxyError::DisallowedHost(ip.to_string()));
                }
                // Hostnames are not resolved here; DNS rebinding is out of reach
                // without an async lookup.
                _ => {}
            }
        }

        Ok(url)
    }

    /// Resolve a manifest-internal reference against the manifest's final
    /// URL without applying host policy.
    pub fn join(&self, raw: &str, base: &Url) -> Result<Url> {
        absolutize(raw, Some(base))
    }

    pub fn allow_list_enabled(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }
}

/// Parse or join `raw` and require an http(s) scheme with a non-empty host.
fn absolutize(raw: &str, base: Option<&Url>) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ProxyError::InvalidReference("empty reference".to_string()));
    }

    let url = match base {
        Some(base) => base.join(raw),
        None => Url::parse(raw),
    }
    .map_err(|e| ProxyError::InvalidReference(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ProxyError::InvalidReference(format!(
                "Scheme '{scheme}' not allowed, only http/https are proxied"
            )));
        }
    }

    match url.host_str() {
        Some(h) if !h.is_empty() => Ok(url),
        _ => Err(ProxyError::InvalidReference(format!("No host in URL: {raw}"))),
    }
}

/// Returns `true` for IPv4 addresses in private or reserved ranges.
///
/// Blocked: `0.0.0.0/8`, `10.0.0.0/8`, `127.0.0.0/8`, `169.254.0.0/16`
/// (link-local, cloud metadata), `172.16.0.0/12`, `192.168.0.0/16`.
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();

    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Returns `true` for IPv6 loopback, link-local (`fe80::/10`) and
/// unique-local (`fc00::/7`) addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();

    ip.is_loopback() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}
