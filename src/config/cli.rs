use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use url::Url;

/// Command-line arguments for the HostPilot binary.
#[derive(Debug, Parser)]
#[command(
    name = "hostpilot",
    version,
    about = "HostPilot realtime change stream and cache invalidation"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HOSTPILOT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the realtime HTTP service.
    Serve(Box<ServeArgs>),
    /// Follow a running server's change stream and keep a local cache fresh.
    Subscribe(Box<SubscribeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the keep-alive interval of event streams.
    #[arg(long = "realtime-heartbeat-interval-seconds", value_name = "SECONDS")]
    pub realtime_heartbeat_interval_seconds: Option<u64>,

    /// Override the per-subscriber queue capacity.
    #[arg(long = "realtime-client-queue-capacity", value_name = "COUNT")]
    pub realtime_client_queue_capacity: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub overrides: SubscribeOverrides,

    /// Base URL of the HostPilot server.
    #[arg(long = "url", value_name = "URL", default_value = "http://127.0.0.1:5000")]
    pub url: Url,

    /// Organization scope of the subscription.
    #[arg(long = "organization-id", value_name = "ID")]
    pub organization_id: Option<i64>,

    /// Endpoint to keep observed in the query cache; repeatable.
    #[arg(long = "watch", value_name = "PATH")]
    pub watch: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SubscribeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the first reconnect delay.
    #[arg(long = "subscription-base-delay-ms", value_name = "MS")]
    pub subscription_base_delay_ms: Option<u64>,

    /// Override the number of reconnects before giving up.
    #[arg(long = "subscription-max-reconnect-attempts", value_name = "COUNT")]
    pub subscription_max_reconnect_attempts: Option<u32>,

    /// Override the event debounce window.
    #[arg(long = "subscription-debounce-ms", value_name = "MS")]
    pub subscription_debounce_ms: Option<u64>,

    /// Override the fast cache entry limit.
    #[arg(long = "cache-fast-cache-limit", value_name = "COUNT")]
    pub cache_fast_cache_limit: Option<usize>,

    /// Override the query cache stale time.
    #[arg(long = "cache-query-stale-time-secs", value_name = "SECONDS")]
    pub cache_query_stale_time_secs: Option<u64>,
}
