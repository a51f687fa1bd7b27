//! Capped exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule for failed encryption jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(0);
        if factor == 0 {
            return self.max_delay;
        }
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retries: 3,
        }
    }

    #[test]
    fn test_known_delays() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_secs(1));
        assert_eq!(p.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let p = policy();
        assert_eq!(p.delay_for(31), Duration::from_secs(1));
        assert_eq!(p.delay_for(32), Duration::from_secs(1));
        assert_eq!(p.delay_for(u32::MAX), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_and_capped(attempt in 0u32..200) {
            let p = policy();
            let a = p.delay_for(attempt);
            let b = p.delay_for(attempt + 1);
            prop_assert!(a <= b);
            prop_assert!(b <= p.max_delay);
        }

        #[test]
        fn prop_delay_bounded_for_any_base(
            base_ms in 1u64..10_000,
            max_ms in 1u64..1_000_000,
            attempt in any::<u32>(),
        ) {
            let p = RetryPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                max_retries: 3,
            };
            prop_assert!(p.delay_for(attempt) <= p.max_delay);
        }
    }
}
