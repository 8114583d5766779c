//! Cache configuration.
//!
//! Explicit bounds for the fast local cache and the query cache, loaded from
//! the `[cache]` section of `hostpilot.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_FAST_CACHE_LIMIT: usize = 500;
const DEFAULT_FAST_CACHE_TTL_SECS: u64 = 30 * 60;
const DEFAULT_QUERY_STALE_TIME_SECS: u64 = 5 * 60;
const DEFAULT_QUERY_GC_TIME_SECS: u64 = 10 * 60;

/// Cache configuration from `hostpilot.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum raw responses held by the fast local cache.
    pub fast_cache_limit: usize,
    /// Default time-to-live for fast cache entries, in seconds.
    pub fast_cache_ttl_secs: u64,
    /// Age after which a query cache entry reads as stale, in seconds.
    pub query_stale_time_secs: u64,
    /// Age after which an unobserved query cache entry is collected, in seconds.
    pub query_gc_time_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_cache_limit: DEFAULT_FAST_CACHE_LIMIT,
            fast_cache_ttl_secs: DEFAULT_FAST_CACHE_TTL_SECS,
            query_stale_time_secs: DEFAULT_QUERY_STALE_TIME_SECS,
            query_gc_time_secs: DEFAULT_QUERY_GC_TIME_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            fast_cache_limit: settings.fast_cache_limit.get(),
            fast_cache_ttl_secs: settings.fast_cache_ttl.as_secs(),
            query_stale_time_secs: settings.query_stale_time.as_secs(),
            query_gc_time_secs: settings.query_gc_time.as_secs(),
        }
    }
}

impl CacheConfig {
    /// Returns the fast cache limit as NonZeroUsize, clamping to 1 if zero.
    pub fn fast_cache_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.fast_cache_limit).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn fast_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fast_cache_ttl_secs)
    }

    pub fn query_stale_time(&self) -> Duration {
        Duration::from_secs(self.query_stale_time_secs)
    }

    pub fn query_gc_time(&self) -> Duration {
        Duration::from_secs(self.query_gc_time_secs)
    }
}
