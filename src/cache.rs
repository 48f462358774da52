//! Result caching with TTL
//!
//! A thread-safe, TTL-based cache for operation results. Values of any
//! `Clone + Send + Sync` type are stored behind `Arc<dyn Any>`; a lookup
//! with the wrong type counts as a miss. Keys are caller-supplied or built
//! with [`TtlCache::derive_key`] as `scope:args_hash`, where `args_hash` is
//! the SHA-256 digest of the canonical JSON arguments.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::trace;

use crate::config::CacheConfig;

/// Thread-safe result cache with TTL expiry
pub struct TtlCache {
    /// Resource name, used as the metrics label
    name: String,
    ttl: Duration,
    max_entries: usize,
    entries: DashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// A cached value with its absolute expiry
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl TtlCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(name: &str, config: &CacheConfig) -> Self {
        Self {
            name: name.to_string(),
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            entries: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Entry lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a live value.
    ///
    /// Returns `None` if the key is absent, expired, or holds a different
    /// type. Expired entries are evicted on the way.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired(now))
                    .is_some()
                {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            Some(entry) => entry.value.downcast_ref::<T>().cloned(),
            None => None,
        };

        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            telemetry_metrics::counter!("resilience_cache_hits_total", "resource" => self.name.clone())
                .increment(1);
            trace!(resource = %self.name, key, "Cache hit");
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            telemetry_metrics::counter!("resilience_cache_misses_total", "resource" => self.name.clone())
                .increment(1);
        }
        hit
    }

    /// Store a value that expires `ttl` from now
    pub fn insert<T>(&self, key: &str, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.make_room(now);
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop expired entries, then the soonest-expiring ones until there is
    /// space for one more
    fn make_room(&self, now: Instant) {
        self.evict_expired_at(now);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().expires_at)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else {
                break;
            };
            if self.entries.remove(&key).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove one entry
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Build a cache key from a scope and arguments
    ///
    /// The key format is `{scope}:{args_hash}` where `args_hash` is the
    /// SHA-256 hex digest of the canonical JSON representation.
    #[must_use]
    pub fn derive_key(scope: &str, arguments: &Value) -> String {
        let args_hash = hash_arguments(arguments);
        format!("{scope}:{args_hash}")
    }

    /// Clear all cached entries and statistics
    pub fn clear(&self) {
        self.entries.clear();
        self.stats.hits.store(0, Ordering::Relaxed);
        self.stats.misses.store(0, Ordering::Relaxed);
        self.stats.evictions.store(0, Ordering::Relaxed);
    }

    /// Evict expired entries (background maintenance)
    pub fn evict_expired(&self) {
        self.evict_expired_at(Instant::now());
    }

    fn evict_expired_at(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        CacheStatsSnapshot {
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: CacheStats::hit_rate(hits, misses),
        }
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("size", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Compute SHA-256 hash of arguments in canonical JSON form
fn hash_arguments(arguments: &Value) -> String {
    // serde_json maps are sorted, so equal objects serialize identically
    let canonical = serde_json::to_string(arguments).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let result = hasher.finalize();
    format!("{result:x}")
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
