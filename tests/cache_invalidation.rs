use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hostpilot::cache::{
    CacheConfig, CacheManager, FastCache, InvalidateOptions, MemoryQueryCache, QueryError,
    QueryFetcher, QueryKey, QueryObserver, ResourceGraph,
};
use hostpilot::types::ResourceType;
use serde_json::{Value, json};

/// Answers every fetch and remembers which endpoints were asked for.
#[derive(Default)]
struct RecordingFetcher {
    fetched: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    fn endpoints(&self) -> BTreeSet<String> {
        self.fetched.lock().expect("lock").iter().cloned().collect()
    }

    fn count(&self, key: &QueryKey) -> usize {
        let label = key.to_string();
        self.fetched
            .lock()
            .expect("lock")
            .iter()
            .filter(|fetched| **fetched == label)
            .count()
    }

    fn reset(&self) {
        self.fetched.lock().expect("lock").clear();
    }
}

#[async_trait]
impl QueryFetcher for RecordingFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, QueryError> {
        let mut fetched = self.fetched.lock().expect("lock");
        fetched.push(key.to_string());
        Ok(json!({ "version": fetched.len() }))
    }
}

struct Harness {
    manager: CacheManager,
    fast: Arc<FastCache>,
    queries: Arc<MemoryQueryCache>,
    fetcher: Arc<RecordingFetcher>,
    _observers: Vec<QueryObserver>,
}

const ENDPOINTS: &[&str] = &[
    "/api/tasks",
    "/api/properties",
    "/api/bookings",
    "/api/booking-revenue",
    "/api/dashboard",
    "/api/finance",
    "/api/system-settings",
    "/api/currency",
    "/api/vendors",
    "/api/owners",
];

fn key_label(endpoint: &str) -> String {
    QueryKey::new(endpoint).to_string()
}

fn harness() -> Harness {
    let config = CacheConfig::default();
    let fast = Arc::new(FastCache::new(&config));
    let fetcher = Arc::new(RecordingFetcher::default());
    let queries = Arc::new(MemoryQueryCache::new(&config, fetcher.clone()));
    let manager = CacheManager::new(ResourceGraph::standard(), Arc::clone(&fast));
    manager.set_query_cache(queries.clone());

    let mut observers = Vec::new();
    for endpoint in ENDPOINTS {
        let key = QueryKey::new(*endpoint);
        queries.set(key.clone(), json!({ "version": 0 }));
        observers.push(queries.observe(key));
        fast.set(
            format!("http://localhost:5000{endpoint}?page=1"),
            Bytes::from_static(b"[]"),
        );
    }

    Harness {
        manager,
        fast,
        queries,
        fetcher,
        _observers: observers,
    }
}

fn labels(endpoints: &[&str]) -> BTreeSet<String> {
    endpoints.iter().map(|endpoint| key_label(endpoint)).collect()
}

#[tokio::test]
async fn settings_change_reaches_all_four_dependents() {
    let h = harness();

    let report = h
        .manager
        .invalidate_resource(ResourceType::Settings, InvalidateOptions::default())
        .await;

    assert_eq!(
        report.resources,
        vec![
            ResourceType::Settings,
            ResourceType::Dashboard,
            ResourceType::Finance,
            ResourceType::Property,
            ResourceType::Booking,
        ]
    );
    assert!(report.is_success());
    assert_eq!(
        h.fetcher.endpoints(),
        labels(&[
            "/api/system-settings",
            "/api/currency",
            "/api/dashboard",
            "/api/finance",
            "/api/booking-revenue",
            "/api/properties",
            "/api/bookings",
        ])
    );

    // Unrelated entries survive in both layers.
    assert!(h.fast.get("http://localhost:5000/api/vendors?page=1").is_some());
    assert!(h.fast.get("http://localhost:5000/api/owners?page=1").is_some());
    assert!(h.fast.get("http://localhost:5000/api/properties?page=1").is_none());
    assert_eq!(
        h.queries.get(&QueryKey::new("/api/vendors")),
        Some(json!({ "version": 0 }))
    );
}

#[tokio::test]
async fn task_change_cascades_to_dashboard_and_finance_only() {
    let h = harness();

    h.manager
        .invalidate_resource(ResourceType::Task, InvalidateOptions::default())
        .await;

    let fetched = h.fetcher.endpoints();
    assert!(fetched.contains(&key_label("/api/tasks")));
    assert!(fetched.contains(&key_label("/api/dashboard")));
    assert!(fetched.contains(&key_label("/api/finance")));
    assert!(!fetched.contains(&key_label("/api/vendors")));
    assert!(!fetched.contains(&key_label("/api/properties")));

    assert!(h.fast.get("http://localhost:5000/api/vendors?page=1").is_some());
    assert!(h.fast.get("http://localhost:5000/api/dashboard?page=1").is_none());
}

#[tokio::test]
async fn skipping_dependencies_purges_only_the_named_resource() {
    let h = harness();

    let report = h
        .manager
        .invalidate_resource(
            ResourceType::Owner,
            InvalidateOptions {
                skip_dependencies: true,
            },
        )
        .await;

    assert_eq!(report.resources, vec![ResourceType::Owner]);
    assert_eq!(h.fetcher.endpoints(), labels(&["/api/owners"]));
    assert_eq!(report.fast_purged, 1);
}

#[tokio::test]
async fn repeated_invalidation_converges_to_the_same_state() {
    let h = harness();

    let first = h
        .manager
        .invalidate_resource(ResourceType::Booking, InvalidateOptions::default())
        .await;
    let fetched_once = h.fetcher.endpoints();
    let fast_after_first = h.fast.len();
    h.fetcher.reset();

    let second = h
        .manager
        .invalidate_resource(ResourceType::Booking, InvalidateOptions::default())
        .await;

    assert!(first.is_success() && second.is_success());
    assert_eq!(h.fetcher.endpoints(), fetched_once);
    assert_eq!(h.fast.len(), fast_after_first);
    assert_eq!(second.fast_purged, 0);
    assert_eq!(h.queries.len(), ENDPOINTS.len());
}

#[tokio::test]
async fn parameterised_keys_are_matched_by_their_endpoint() {
    let h = harness();
    let analytics = QueryKey::new("/api/finance/analytics").with_param(json!({ "propertyId": 66 }));
    h.queries.set(analytics.clone(), json!({ "version": 0 }));
    let _watch = h.queries.observe(analytics.clone());

    h.manager
        .invalidate_resource(ResourceType::Finance, InvalidateOptions::default())
        .await;

    assert!(h.fetcher.endpoints().contains(&analytics.to_string()));
    assert_ne!(h.queries.get(&analytics), Some(json!({ "version": 0 })));
}

#[tokio::test]
async fn shared_entries_are_fetched_once_per_pass() {
    let fast = Arc::new(FastCache::default());
    let fetcher = Arc::new(RecordingFetcher::default());
    let queries = Arc::new(MemoryQueryCache::new(
        &CacheConfig::default(),
        fetcher.clone(),
    ));
    let manager = CacheManager::new(ResourceGraph::standard(), fast);
    manager.set_query_cache(queries.clone());

    // Task, dashboard and finance all own these two entries.
    let dashboard = QueryKey::new("/api/dashboard");
    let analytics = QueryKey::new("/api/finance/analytics").with_param(json!({ "propertyId": 66 }));
    let _dashboard = queries.observe(dashboard.clone());
    let _analytics = queries.observe(analytics.clone());

    let report = manager
        .invalidate_resource(ResourceType::Task, InvalidateOptions::default())
        .await;

    assert!(report.is_success());
    assert_eq!(report.refetched, 2);
    assert_eq!(fetcher.count(&dashboard), 1);
    assert_eq!(fetcher.count(&analytics), 1);

    fetcher.reset();
    let report = manager
        .invalidate_multiple(&[ResourceType::Task, ResourceType::Finance])
        .await;

    assert_eq!(report.refetched, 2);
    assert_eq!(fetcher.count(&dashboard), 1);
    assert_eq!(fetcher.count(&analytics), 1);
}

#[tokio::test]
async fn batch_invalidation_visits_each_resource_once() {
    let h = harness();

    let report = h
        .manager
        .invalidate_multiple(&[ResourceType::Task, ResourceType::Booking, ResourceType::Task])
        .await;

    assert_eq!(
        report.resources,
        vec![
            ResourceType::Task,
            ResourceType::Dashboard,
            ResourceType::Finance,
            ResourceType::Booking,
        ]
    );
    assert_eq!(report.fast_purged, 5);
    assert!(!h.fetcher.endpoints().contains(&key_label("/api/owners")));
}

#[tokio::test]
async fn missing_query_cache_still_purges_fast_cache() {
    let fast = Arc::new(FastCache::default());
    fast.set("http://localhost:5000/api/vendors", Bytes::from_static(b"[]"));
    fast.set("http://localhost:5000/api/owners", Bytes::from_static(b"[]"));
    let manager = CacheManager::new(ResourceGraph::standard(), Arc::clone(&fast));

    let report = manager
        .invalidate_resource(ResourceType::Vendor, InvalidateOptions::default())
        .await;

    assert!(!report.query_cache_ready);
    assert_eq!(report.fast_purged, 1);
    assert_eq!(fast.len(), 1);
}

#[tokio::test]
async fn clear_all_empties_both_layers() {
    let h = harness();

    h.manager.clear_all().await;

    assert!(h.fast.is_empty());
    assert!(h.queries.is_empty());
}
