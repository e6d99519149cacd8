//! Explicit retry policy for network-facing collaborators.
//!
//! The registry client and the fetcher take a [`RetryPolicy`] by value
//! instead of burying backoff constants in a helper, so retry behavior is
//! visible in configuration and testable with fakes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff schedule with a capped attempt count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Multiplier applied per subsequent attempt
    pub multiplier: u32,

    /// Ceiling on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            multiplier: 1,
            max_delay_ms: 0,
        }
    }

    /// Delay to sleep after the `attempt`-th failure (1-based). Returns
    /// `None` once the attempt budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let factor = (self.multiplier as u64).saturating_pow(exp);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(1000)));
        // Third failure exhausts the three-attempt budget
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_delay_ms: 1000,
            multiplier: 10,
            max_delay_ms: 5000,
        };
        assert_eq!(policy.delay_after(6), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_none_never_sleeps() {
        assert_eq!(RetryPolicy::none().delay_after(1), None);
    }
}
