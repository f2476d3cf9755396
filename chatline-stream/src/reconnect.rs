//! Reconnection policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use chatline_core::ConfigError;

/// Exponential backoff without jitter: attempt `i` waits
/// `base_delay_ms * 2^(i-1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    /// Attempts after which the manager stops reconnecting on its own.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before reconnection attempt `attempt` (1-based). Attempt 0 has
    /// no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(63);
        let multiplier = 1_u64 << shift;
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    /// Whether another attempt may follow `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::invalid("reconnect.base_delay_ms", "must be > 0"));
        }
        Ok(())
    }
}
