use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the crate records. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            "hostpilot_realtime_clients",
            Unit::Count,
            "Current number of connected realtime subscribers."
        );
        describe_counter!(
            "hostpilot_realtime_frames_delivered_total",
            Unit::Count,
            "Total number of event frames queued for subscribers."
        );
        describe_counter!(
            "hostpilot_realtime_frames_dropped_total",
            Unit::Count,
            "Total number of frames dropped because a subscriber queue was full."
        );
        describe_counter!(
            "hostpilot_realtime_clients_pruned_total",
            Unit::Count,
            "Total number of subscribers removed after a failed write."
        );
        describe_counter!(
            "hostpilot_fast_cache_hit_total",
            Unit::Count,
            "Total number of fast cache hits."
        );
        describe_counter!(
            "hostpilot_fast_cache_miss_total",
            Unit::Count,
            "Total number of fast cache misses, expired entries included."
        );
        describe_counter!(
            "hostpilot_fast_cache_evict_total",
            Unit::Count,
            "Total number of fast cache evictions due to capacity."
        );
        describe_counter!(
            "hostpilot_fast_cache_purged_total",
            Unit::Count,
            "Total number of fast cache entries removed by pattern invalidation."
        );
        describe_histogram!(
            "hostpilot_cache_invalidate_ms",
            Unit::Milliseconds,
            "Cache invalidation latency in milliseconds."
        );
        describe_counter!(
            "hostpilot_subscription_reconnects_total",
            Unit::Count,
            "Total number of scheduled subscription reconnects."
        );
        describe_counter!(
            "hostpilot_subscription_events_total",
            Unit::Count,
            "Total number of change events received by the subscription client."
        );
    });
}
