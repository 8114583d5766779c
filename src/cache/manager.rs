//! Dependency-aware cache manager.
//!
//! Translates "resource changed" into purges of the fast local cache and
//! invalidation plus active refetch in the query cache, cascading to the
//! declared dependents of each resource.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use hostpilot_realtime_types::ResourceType;
use metrics::histogram;
use tracing::{debug, info, instrument, warn};

use super::fast::FastCache;
use super::graph::ResourceGraph;
use super::keys::QueryKey;
use super::lock::{rw_read, rw_write};
use super::planner::InvalidationPlan;
use super::query::{QueryCache, QueryError, QueryPredicate};

const SOURCE: &str = "cache::manager";
const METRIC_CACHE_INVALIDATE_MS: &str = "hostpilot_cache_invalidate_ms";

/// Options for [`CacheManager::invalidate_resource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidateOptions {
    /// Purge only the named resource, not its dependents.
    pub skip_dependencies: bool,
}

/// A query cache step that failed for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFailure {
    pub resource: ResourceType,
    pub error: QueryError,
}

/// What one invalidation pass touched.
#[derive(Debug, Default)]
pub struct InvalidationReport {
    /// Resource types visited, roots first.
    pub resources: Vec<ResourceType>,
    pub fast_purged: usize,
    pub query_invalidated: usize,
    pub refetched: usize,
    /// False when no query cache was wired in and the query step was skipped.
    pub query_cache_ready: bool,
    pub failures: Vec<ResourceFailure>,
}

impl InvalidationReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for InvalidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationReport {{ resources: {}, fast_purged: {}, query_invalidated: {}, \
             refetched: {}, failures: {} }}",
            self.resources.len(),
            self.fast_purged,
            self.query_invalidated,
            self.refetched,
            self.failures.len(),
        )
    }
}

/// Owns the fast cache and drives the query cache on resource changes.
pub struct CacheManager {
    graph: ResourceGraph,
    fast: Arc<FastCache>,
    query: RwLock<Option<Arc<dyn QueryCache>>>,
}

impl CacheManager {
    pub fn new(graph: ResourceGraph, fast: Arc<FastCache>) -> Self {
        Self {
            graph,
            fast,
            query: RwLock::new(None),
        }
    }

    /// Wire in the live query cache. Replaces any previous one.
    pub fn set_query_cache(&self, cache: Arc<dyn QueryCache>) {
        *rw_write(&self.query, SOURCE, "set_query_cache") = Some(cache);
        info!(target: "hostpilot::cache::manager", "Query cache wired in");
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn fast_cache(&self) -> &Arc<FastCache> {
        &self.fast
    }

    fn query_cache(&self) -> Option<Arc<dyn QueryCache>> {
        rw_read(&self.query, SOURCE, "query_cache").clone()
    }

    /// Purge and refetch everything belonging to `resource`, then repeat for
    /// its declared dependents unless told to skip them.
    #[instrument(
        skip_all,
        fields(resource = %resource, skip_dependencies = options.skip_dependencies)
    )]
    pub async fn invalidate_resource(
        &self,
        resource: ResourceType,
        options: InvalidateOptions,
    ) -> InvalidationReport {
        let started_at = Instant::now();
        let plan = InvalidationPlan::for_resource(&self.graph, resource, options.skip_dependencies);
        info!(%plan, "Invalidating resource");

        let query = self.query_cache();
        let mut report = self.report_for(&plan, &query);

        // Each resource is fully purged before the next is visited.
        let mut refreshed = HashSet::new();
        for planned in plan.resources() {
            report.fast_purged += self.purge_fast(*planned);
            if let Some(query) = &query {
                self.refresh_queries(query.as_ref(), *planned, &mut refreshed, &mut report)
                    .await;
            }
        }

        self.finish(&report, started_at);
        report
    }

    /// Purge the union of `resources` and their dependents from the fast
    /// cache first, then invalidate and refetch the same union.
    #[instrument(skip_all, fields(requested = resources.len()))]
    pub async fn invalidate_multiple(&self, resources: &[ResourceType]) -> InvalidationReport {
        let started_at = Instant::now();
        let plan = InvalidationPlan::for_resources(&self.graph, resources);
        info!(%plan, "Invalidating resources");

        let query = self.query_cache();
        let mut report = self.report_for(&plan, &query);

        report.fast_purged = plan
            .patterns(&self.graph)
            .into_iter()
            .map(|pattern| self.fast.delete_by_pattern(pattern))
            .sum();
        if let Some(query) = &query {
            let mut refreshed = HashSet::new();
            for planned in plan.resources() {
                self.refresh_queries(query.as_ref(), *planned, &mut refreshed, &mut report)
                    .await;
            }
        }

        self.finish(&report, started_at);
        report
    }

    /// Empty both cache layers unconditionally.
    pub async fn clear_all(&self) {
        self.fast.clear();
        if let Some(query) = self.query_cache() {
            query.clear().await;
        }
        info!(target: "hostpilot::cache::manager", "Cleared all caches");
    }

    fn report_for(
        &self,
        plan: &InvalidationPlan,
        query: &Option<Arc<dyn QueryCache>>,
    ) -> InvalidationReport {
        if query.is_none() && !plan.is_empty() {
            warn!(
                plan = %plan,
                "Query cache not wired in; only the fast cache is purged"
            );
        }
        InvalidationReport {
            resources: plan.resources().to_vec(),
            query_cache_ready: query.is_some(),
            ..Default::default()
        }
    }

    fn purge_fast(&self, resource: ResourceType) -> usize {
        self.graph
            .patterns_for(resource)
            .iter()
            .map(|pattern| self.fast.delete_by_pattern(pattern))
            .sum()
    }

    /// Invalidate and refetch the entries owned by `resource`. Keys already
    /// in `refreshed` were fetched earlier in this pass and are not fetched
    /// again.
    async fn refresh_queries(
        &self,
        query: &dyn QueryCache,
        resource: ResourceType,
        refreshed: &mut HashSet<QueryKey>,
        report: &mut InvalidationReport,
    ) {
        let patterns = self.graph.patterns_for(resource);
        if patterns.is_empty() {
            return;
        }
        let predicate = QueryPredicate::matching(patterns);

        report.query_invalidated += query.invalidate(&predicate).await;
        match query.refetch_active(&predicate, refreshed).await {
            Ok(outcome) => {
                report.refetched += outcome.refetched;
                refreshed.extend(outcome.attempted);
                for error in outcome.failures {
                    report.failures.push(ResourceFailure { resource, error });
                }
                debug!(%resource, refetched = outcome.refetched, "Refetched queries");
            }
            Err(error) => {
                warn!(%resource, error = %error, "Query refetch failed for resource");
                report.failures.push(ResourceFailure { resource, error });
            }
        }
    }

    fn finish(&self, report: &InvalidationReport, started_at: Instant) {
        histogram!(METRIC_CACHE_INVALIDATE_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        if report.is_success() {
            info!(%report, "Invalidation complete");
        } else {
            warn!(%report, "Invalidation completed with failures");
        }
    }
}
