use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hostpilot::cache::{CacheConfig, CacheManager, FastCache, InvalidateOptions, ResourceGraph};
use hostpilot::infra::telemetry;
use hostpilot::realtime::{EventBus, RealtimeConfig};
use hostpilot::subscription::{
    EventTransport, FrameStream, SubscriptionClient, SubscriptionConfig, SubscriptionState,
    TransportError,
};
use hostpilot::types::{ChangeEvent, RealtimeAction, ResourceType};
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serial_test::serial;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn recorded_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

#[tokio::test]
#[serial]
async fn realtime_and_cache_paths_emit_expected_metric_keys() {
    snapshotter();

    // A one-slot queue: the handshake fills it, so the next broadcast is dropped.
    let bus = Arc::new(EventBus::new(RealtimeConfig {
        heartbeat_interval: Duration::from_secs(3600),
        client_queue_capacity: 1,
    }));
    let _slow = bus.add_client(Some(1));
    let mut drained = bus.add_client(Some(1));
    assert!(drained.try_recv().is_some());
    bus.broadcast(
        ChangeEvent::new(ResourceType::Booking, RealtimeAction::Update).with_organization(1),
    );

    let fast = Arc::new(FastCache::new(&CacheConfig {
        fast_cache_limit: 1,
        ..Default::default()
    }));
    fast.set("/api/vendors?page=1", Bytes::from_static(b"[]"));
    fast.set("/api/vendors?page=2", Bytes::from_static(b"[]"));
    assert!(fast.get("/api/vendors?page=1").is_none());
    assert!(fast.get("/api/vendors?page=2").is_some());

    let manager = CacheManager::new(ResourceGraph::standard(), Arc::clone(&fast));
    let report = manager
        .invalidate_resource(ResourceType::Vendor, InvalidateOptions::default())
        .await;
    assert_eq!(report.fast_purged, 1);

    let names = recorded_names();
    let expected = [
        "hostpilot_realtime_clients",
        "hostpilot_realtime_frames_delivered_total",
        "hostpilot_realtime_frames_dropped_total",
        "hostpilot_fast_cache_hit_total",
        "hostpilot_fast_cache_miss_total",
        "hostpilot_fast_cache_evict_total",
        "hostpilot_fast_cache_purged_total",
        "hostpilot_cache_invalidate_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

struct RefusingTransport;

#[async_trait]
impl EventTransport for RefusingTransport {
    async fn open(&self, _organization_id: Option<i64>) -> Result<FrameStream, TransportError> {
        Err(TransportError::Connect("connection refused".to_string()))
    }
}

#[tokio::test]
#[serial]
async fn subscription_reconnects_are_counted() {
    snapshotter();

    let manager = Arc::new(CacheManager::new(
        ResourceGraph::standard(),
        Arc::new(FastCache::default()),
    ));
    let config = SubscriptionConfig {
        base_delay_ms: 1,
        max_reconnect_attempts: 2,
        debounce_ms: 10,
    };
    let mut client = SubscriptionClient::new(config, Arc::new(RefusingTransport), manager);
    let mut state = client.subscribe_state();
    client.connect();

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|current| *current == SubscriptionState::Failed),
    )
    .await
    .expect("subscription gives up in time")
    .expect("client alive");

    assert!(recorded_names().contains("hostpilot_subscription_reconnects_total"));
    client.disconnect();
}
