//! Reconnect backoff policy.

use std::time::Duration;

use super::config::SubscriptionConfig;

/// Exponential backoff with a ceiling on scheduled reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// `base_delay * 2^attempt`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay before the next reconnect when `attempts` reconnects have
    /// already been scheduled, or `None` once the ceiling is reached.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        (attempts < self.max_attempts).then(|| self.delay_for(attempts))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&SubscriptionConfig::default())
    }
}

impl From<&SubscriptionConfig> for ReconnectPolicy {
    fn from(config: &SubscriptionConfig) -> Self {
        Self::new(config.base_delay(), config.max_reconnect_attempts)
    }
}
