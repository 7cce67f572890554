/// Retry policy for the publisher-creation step
///
/// Publisher creation races session establishment on the agent side, so
/// bring-up retries it instead of failing fast. Unbounded by default; a
/// bounded policy turns exhaustion into a regular fatal setup error.
use crate::config::RetryConfig;
use std::time::Duration;

const INITIAL_BACKOFF: Duration = Duration::ZERO;
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_ATTEMPTS: usize = 0; // 0 means retry forever

/// Retry strategy with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_attempts: usize, // 0 = unbounded
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            multiplier: BACKOFF_MULTIPLIER,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, forever
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Give up after `max_attempts` attempts
    pub fn bounded(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_attempts,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == 0
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi((attempt - 1).min(i32::MAX as usize) as i32);

        if !delay_ms.is_finite() || delay_ms >= self.max_backoff.as_millis() as f64 {
            return self.max_backoff;
        }
        Duration::from_millis(delay_ms as u64).min(self.max_backoff)
    }

    /// Check if another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: usize) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }
}
