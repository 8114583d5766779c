//! Query cache seam and in-memory implementation.
//!
//! The cache manager drives a [`QueryCache`] without owning its storage.
//! [`MemoryQueryCache`] is the process-local implementation: it stores
//! fetched data per [`QueryKey`], tracks observers, and refetches through a
//! [`QueryFetcher`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::keys::QueryKey;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::query";

/// Failure of a query cache operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("fetching {key} failed: {message}")]
    Fetch { key: String, message: String },
    #[error("query cache unavailable: {0}")]
    Unavailable(String),
}

impl QueryError {
    pub fn fetch(key: &QueryKey, message: impl Into<String>) -> Self {
        Self::Fetch {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Selects query cache entries whose text parts contain any of a set of
/// substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPredicate {
    patterns: Vec<String>,
}

impl QueryPredicate {
    pub fn matching<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|pattern| pattern.as_ref().to_string())
                .collect(),
        }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        key.matches_any(&self.patterns)
    }
}

impl fmt::Display for QueryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "any of {:?}", self.patterns)
    }
}

/// Result of refetching the observed entries selected by a predicate.
#[derive(Debug, Default)]
pub struct RefetchOutcome {
    pub refetched: usize,
    pub failures: Vec<QueryError>,
    /// Every key a fetch was issued for, successful or not.
    pub attempted: Vec<QueryKey>,
}

impl RefetchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Request-keyed cache observed by the UI.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Mark matching entries stale. Returns how many entries matched.
    async fn invalidate(&self, predicate: &QueryPredicate) -> usize;

    /// Refetch matching entries that currently have at least one observer,
    /// leaving out the keys in `skip`.
    ///
    /// A failing entry is recorded in the outcome and does not stop the
    /// remaining refetches.
    async fn refetch_active(
        &self,
        predicate: &QueryPredicate,
        skip: &HashSet<QueryKey>,
    ) -> Result<RefetchOutcome, QueryError>;

    async fn clear(&self);
}

/// Loads fresh data for a query key.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, QueryError>;
}

#[derive(Debug)]
struct QueryEntry {
    data: Option<Value>,
    invalidated: bool,
    observers: usize,
    updated_at: Instant,
    unobserved_since: Option<Instant>,
}

impl QueryEntry {
    fn empty(now: Instant) -> Self {
        Self {
            data: None,
            invalidated: false,
            observers: 0,
            updated_at: now,
            unobserved_since: Some(now),
        }
    }

    fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        self.invalidated
            || self.data.is_none()
            || now.saturating_duration_since(self.updated_at) >= stale_time
    }

    fn store(&mut self, data: Value, now: Instant) {
        self.data = Some(data);
        self.invalidated = false;
        self.updated_at = now;
    }
}

/// In-memory [`QueryCache`] with explicit stale and gc limits.
pub struct MemoryQueryCache {
    entries: Mutex<HashMap<QueryKey, QueryEntry>>,
    fetcher: Arc<dyn QueryFetcher>,
    stale_time: Duration,
    gc_time: Duration,
}

impl MemoryQueryCache {
    pub fn new(config: &CacheConfig, fetcher: Arc<dyn QueryFetcher>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fetcher,
            stale_time: config.query_stale_time(),
            gc_time: config.query_gc_time(),
        }
    }

    /// Cached data when fresh, otherwise fetched and stored.
    pub async fn fetch(&self, key: &QueryKey) -> Result<Value, QueryError> {
        {
            let entries = mutex_lock(&self.entries, SOURCE, "fetch.lookup");
            let fresh = entries
                .get(key)
                .filter(|entry| !entry.is_stale(Instant::now(), self.stale_time))
                .and_then(|entry| entry.data.clone());
            if let Some(data) = fresh {
                return Ok(data);
            }
        }

        let data = self.fetcher.fetch(key).await?;
        self.set(key.clone(), data.clone());
        Ok(data)
    }

    /// Store data for `key`, marking it fresh.
    pub fn set(&self, key: QueryKey, data: Value) {
        let now = Instant::now();
        mutex_lock(&self.entries, SOURCE, "set")
            .entry(key)
            .or_insert_with(|| QueryEntry::empty(now))
            .store(data, now);
    }

    /// Cached data regardless of staleness.
    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        mutex_lock(&self.entries, SOURCE, "get")
            .get(key)
            .and_then(|entry| entry.data.clone())
    }

    /// Staleness of `key`, or `None` when the key is not cached.
    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        mutex_lock(&self.entries, SOURCE, "is_stale")
            .get(key)
            .map(|entry| entry.is_stale(Instant::now(), self.stale_time))
    }

    /// Register an observer of `key`; the entry counts as active until the
    /// returned guard is dropped.
    pub fn observe(self: &Arc<Self>, key: QueryKey) -> QueryObserver {
        {
            let now = Instant::now();
            let mut entries = mutex_lock(&self.entries, SOURCE, "observe");
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| QueryEntry::empty(now));
            entry.observers += 1;
            entry.unobserved_since = None;
        }
        QueryObserver {
            cache: Arc::clone(self),
            key,
        }
    }

    fn release(&self, key: &QueryKey) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "release");
        if let Some(entry) = entries.get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
            if entry.observers == 0 {
                entry.unobserved_since = Some(Instant::now());
            }
        }
    }

    /// Drop entries that have had no observer for longer than the gc time.
    ///
    /// Returns how many entries were collected.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut entries = mutex_lock(&self.entries, SOURCE, "gc");
        let before = entries.len();
        entries.retain(|_, entry| match entry.unobserved_since {
            Some(since) => now.saturating_duration_since(since) < self.gc_time,
            None => true,
        });
        let collected = before - entries.len();
        if collected > 0 {
            debug!(collected, remaining = entries.len(), "Query cache gc");
        }
        collected
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueryCache for MemoryQueryCache {
    async fn invalidate(&self, predicate: &QueryPredicate) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
        let mut matched = 0;
        for (key, entry) in entries.iter_mut() {
            if predicate.matches(key) {
                entry.invalidated = true;
                matched += 1;
            }
        }
        matched
    }

    async fn refetch_active(
        &self,
        predicate: &QueryPredicate,
        skip: &HashSet<QueryKey>,
    ) -> Result<RefetchOutcome, QueryError> {
        let active: Vec<QueryKey> = mutex_lock(&self.entries, SOURCE, "refetch_active")
            .iter()
            .filter(|(key, entry)| {
                entry.observers > 0 && !skip.contains(*key) && predicate.matches(key)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let fetcher = &self.fetcher;
        let results = join_all(active.iter().map(|key| async move {
            let result = fetcher.fetch(key).await;
            (key, result)
        }))
        .await;

        let mut outcome = RefetchOutcome::default();
        for (key, result) in results {
            outcome.attempted.push(key.clone());
            match result {
                Ok(data) => {
                    let now = Instant::now();
                    if let Some(entry) =
                        mutex_lock(&self.entries, SOURCE, "refetch_active.store").get_mut(key)
                    {
                        entry.store(data, now);
                    }
                    outcome.refetched += 1;
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Query refetch failed");
                    outcome.failures.push(err);
                }
            }
        }
        Ok(outcome)
    }

    async fn clear(&self) {
        mutex_lock(&self.entries, SOURCE, "clear").clear();
    }
}

/// Keeps a query entry active while held.
pub struct QueryObserver {
    cache: Arc<MemoryQueryCache>,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
