use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::env_or;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(4_000),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("CHAT_MAX_ATTEMPTS", 3usize).clamp(1, 10),
            base_delay: Duration::from_millis(env_or("CHAT_RETRY_BASE_DELAY_MS", 250u64).min(60_000)),
            max_delay: Duration::from_millis(env_or("CHAT_RETRY_MAX_DELAY_MS", 4_000u64).min(300_000)),
        }
    }

    /// No retries at all; used by tests and callers that handle retry themselves.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retrying after the 1-based `attempt` failed: the base delay
    /// doubled per earlier attempt, never above `max_delay`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(30) as u32;
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}
