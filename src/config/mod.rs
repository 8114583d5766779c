//! Configuration loading and validation.

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CliArgs, Command, LoggingOverrides, ServeArgs, ServeOverrides, SubscribeArgs,
    SubscribeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hostpilot";
const ENV_PREFIX: &str = "HOSTPILOT";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_FAST_CACHE_LIMIT: usize = 500;
const DEFAULT_FAST_CACHE_TTL_SECS: u64 = 30 * 60;
const DEFAULT_QUERY_STALE_TIME_SECS: u64 = 5 * 60;
const DEFAULT_QUERY_GC_TIME_SECS: u64 = 10 * 60;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_DEBOUNCE_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub realtime: RealtimeSettings,
    pub cache: CacheSettings,
    pub subscription: SubscriptionSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub heartbeat_interval: Duration,
    pub client_queue_capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub fast_cache_limit: NonZeroUsize,
    pub fast_cache_ttl: Duration,
    pub query_stale_time: Duration,
    pub query_gc_time: Duration,
}

#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub debounce: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings from files, `HOSTPILOT__*` environment variables, and CLI overrides.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Subscribe(args)) => raw.apply_subscribe_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    realtime: RawRealtimeSettings,
    cache: RawCacheSettings,
    subscription: RawSubscriptionSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_logging_overrides(&overrides.logging);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.realtime_heartbeat_interval_seconds {
            self.realtime.heartbeat_interval_seconds = Some(seconds);
        }
        if let Some(capacity) = overrides.realtime_client_queue_capacity {
            self.realtime.client_queue_capacity = Some(capacity);
        }
    }

    fn apply_subscribe_overrides(&mut self, overrides: &SubscribeOverrides) {
        self.apply_logging_overrides(&overrides.logging);

        if let Some(ms) = overrides.subscription_base_delay_ms {
            self.subscription.base_delay_ms = Some(ms);
        }
        if let Some(attempts) = overrides.subscription_max_reconnect_attempts {
            self.subscription.max_reconnect_attempts = Some(attempts);
        }
        if let Some(ms) = overrides.subscription_debounce_ms {
            self.subscription.debounce_ms = Some(ms);
        }
        if let Some(limit) = overrides.cache_fast_cache_limit {
            self.cache.fast_cache_limit = Some(limit);
        }
        if let Some(seconds) = overrides.cache_query_stale_time_secs {
            self.cache.query_stale_time_secs = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            realtime,
            cache,
            subscription,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            realtime: build_realtime_settings(realtime)?,
            cache: build_cache_settings(cache)?,
            subscription: build_subscription_settings(subscription)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown = non_zero_duration(
        server
            .graceful_shutdown_seconds
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS),
        Duration::from_secs,
        "server.graceful_shutdown_seconds",
    )?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let heartbeat_interval = non_zero_duration(
        realtime
            .heartbeat_interval_seconds
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
        Duration::from_secs,
        "realtime.heartbeat_interval_seconds",
    )?;
    let client_queue_capacity = non_zero_usize(
        realtime
            .client_queue_capacity
            .unwrap_or(DEFAULT_CLIENT_QUEUE_CAPACITY),
        "realtime.client_queue_capacity",
    )?;

    Ok(RealtimeSettings {
        heartbeat_interval,
        client_queue_capacity,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let fast_cache_limit = non_zero_usize(
        cache.fast_cache_limit.unwrap_or(DEFAULT_FAST_CACHE_LIMIT),
        "cache.fast_cache_limit",
    )?;
    let fast_cache_ttl = non_zero_duration(
        cache
            .fast_cache_ttl_secs
            .unwrap_or(DEFAULT_FAST_CACHE_TTL_SECS),
        Duration::from_secs,
        "cache.fast_cache_ttl_secs",
    )?;
    let query_stale_time = Duration::from_secs(
        cache
            .query_stale_time_secs
            .unwrap_or(DEFAULT_QUERY_STALE_TIME_SECS),
    );
    let query_gc_time = non_zero_duration(
        cache
            .query_gc_time_secs
            .unwrap_or(DEFAULT_QUERY_GC_TIME_SECS),
        Duration::from_secs,
        "cache.query_gc_time_secs",
    )?;

    Ok(CacheSettings {
        fast_cache_limit,
        fast_cache_ttl,
        query_stale_time,
        query_gc_time,
    })
}

fn build_subscription_settings(
    subscription: RawSubscriptionSettings,
) -> Result<SubscriptionSettings, LoadError> {
    let base_delay = non_zero_duration(
        subscription.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS),
        Duration::from_millis,
        "subscription.base_delay_ms",
    )?;
    let debounce = non_zero_duration(
        subscription.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
        Duration::from_millis,
        "subscription.debounce_ms",
    )?;

    Ok(SubscriptionSettings {
        base_delay,
        max_reconnect_attempts: subscription
            .max_reconnect_attempts
            .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        debounce,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    heartbeat_interval_seconds: Option<u64>,
    client_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    fast_cache_limit: Option<usize>,
    fast_cache_ttl_secs: Option<u64>,
    query_stale_time_secs: Option<u64>,
    query_gc_time_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSubscriptionSettings {
    base_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    debounce_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}
