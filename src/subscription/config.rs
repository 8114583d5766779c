//! Subscription client configuration.
//!
//! Loaded from the `[subscription]` section of `hostpilot.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_DEBOUNCE_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// First reconnect delay; each further attempt doubles it.
    pub base_delay_ms: u64,
    /// Reconnects scheduled before the subscription gives up.
    pub max_reconnect_attempts: u32,
    /// Quiet period that coalesces bursts of events.
    pub debounce_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl From<&crate::config::SubscriptionSettings> for SubscriptionConfig {
    fn from(settings: &crate::config::SubscriptionSettings) -> Self {
        Self {
            base_delay_ms: settings.base_delay.as_millis() as u64,
            max_reconnect_attempts: settings.max_reconnect_attempts,
            debounce_ms: settings.debounce.as_millis() as u64,
        }
    }
}

impl SubscriptionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
