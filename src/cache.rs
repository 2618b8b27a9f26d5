//! Bounded TTL caches for rewritten manifests and relayed segments.
//!
//! Both caches share key and expiry semantics: entries are keyed by the
//! resolved origin URL and stop being returned once their age exceeds their
//! TTL. Expired entries are dropped lazily on lookup and eagerly by
//! [`TtlCache::purge_expired`].
//!
//! Capacity is bounded per cache. Inserting a new key into a full cache
//! evicts an expired entry if one exists, otherwise the least-recently-used
//! entry. Victim selection is a linear scan over the map, which is fine for
//! the entry counts involved (thousands, not millions).

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::metrics;

/// Default TTL for both caches.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    /// Logical access tick for LRU ordering
    last_access: AtomicU64,
}

impl<V> CachedEntry<V> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Thread-safe key-value cache with per-entry TTL and bounded size.
///
/// `insert` replaces the whole entry under the shard lock, so a concurrent
/// `get` sees either the old or the new value, never a mix.
#[derive(Clone, Debug)]
pub struct TtlCache<V> {
    name: &'static str,
    entries: Arc<DashMap<String, CachedEntry<V>>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<AtomicU64>,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache holding at most `capacity` entries. A capacity of zero
    /// disables caching.
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            name,
            entries: Arc::new(DashMap::new()),
            ttl,
            capacity,
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the cached value for `key` if present and fresh.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                debug!("{} cache HIT for {}", self.name, key);
                metrics::record_cache_lookup(self.name, true);
                return Some(entry.value.clone());
            }
            // Stale: drop the read guard, then remove only if still stale so a
            // concurrent refresh is not thrown away.
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        debug!("{} cache MISS for {}", self.name, key);
        metrics::record_cache_lookup(self.name, false);
        None
    }

    /// Insert with the cache's default TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Insert, fully replacing any existing entry for `key`.
    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }

        if !self.entries.contains_key(key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }

        self.entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                last_access: AtomicU64::new(self.tick()),
            },
        );

        // Concurrent inserts of distinct keys can overshoot by a few entries.
        while self.entries.len() > self.capacity {
            if !self.evict_one() {
                break;
            }
        }
    }

    /// Evict one entry: an expired one if any, else the least recently used.
    /// Returns `false` when the cache is empty.
    fn evict_one(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| (!e.is_expired(), e.last_access.load(Ordering::Relaxed)))
            .map(|e| e.key().clone());

        match victim {
            Some(key) => {
                debug!("{} cache evicting {}", self.name, key);
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// A relayed segment body together with the media type it was served as.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedSegment {
    pub body: Bytes,
    pub content_type: String,
}

/// Rewritten manifest text, stored as UTF-8 bytes.
pub type ManifestCache = TtlCache<Bytes>;

pub type SegmentCache = TtlCache<CachedSegment>;
