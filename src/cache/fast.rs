//! Fast local cache.
//!
//! Short-lived raw responses keyed by request URL. Entries are bounded by an
//! LRU limit and expire individually; expired entries are dropped on read.

use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::fast";

const METRIC_HIT: &str = "hostpilot_fast_cache_hit_total";
const METRIC_MISS: &str = "hostpilot_fast_cache_miss_total";
const METRIC_EVICT: &str = "hostpilot_fast_cache_evict_total";
const METRIC_PURGED: &str = "hostpilot_fast_cache_purged_total";

struct FastEntry {
    body: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl FastEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// Process-wide raw response cache.
pub struct FastCache {
    entries: RwLock<LruCache<String, FastEntry>>,
    default_ttl: Duration,
}

impl FastCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.fast_cache_limit_non_zero())),
            default_ttl: config.fast_cache_ttl(),
        }
    }

    /// Cached body for `url`, unless absent or expired.
    pub fn get(&self, url: &str) -> Option<Bytes> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(url) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                counter!(METRIC_HIT).increment(1);
                return Some(entry.body.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(url);
        }
        counter!(METRIC_MISS).increment(1);
        None
    }

    /// Store `body` under `url` with the default time-to-live.
    pub fn set(&self, url: impl Into<String>, body: Bytes) {
        self.set_with_ttl(url, body, self.default_ttl);
    }

    pub fn set_with_ttl(&self, url: impl Into<String>, body: Bytes, ttl: Duration) {
        let url = url.into();
        let entry = FastEntry {
            body,
            inserted_at: Instant::now(),
            ttl,
        };
        let displaced = rw_write(&self.entries, SOURCE, "set").push(url.clone(), entry);
        if displaced.is_some_and(|(displaced_url, _)| displaced_url != url) {
            counter!(METRIC_EVICT).increment(1);
        }
    }

    /// Remove every entry whose URL contains `pattern`.
    ///
    /// Returns the number of entries removed.
    pub fn delete_by_pattern(&self, pattern: &str) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_by_pattern");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(url, _)| url.contains(pattern))
            .map(|(url, _)| url.clone())
            .collect();
        for url in &doomed {
            entries.pop(url);
        }
        if !doomed.is_empty() {
            counter!(METRIC_PURGED).increment(doomed.len() as u64);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Number of entries held, including expired ones not yet read.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FastCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
