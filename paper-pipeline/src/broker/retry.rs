//! 配送失敗時の再試行ポリシー（指数バックオフ + Full Jitter）。

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大配送回数（初回を含む）。0 はキューへの無制限な再投入を意味する。
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Requeue forever with no delay.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self::new(0, 0, 0)
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_delivery_attempts(),
            config.retry_backoff_base_ms(),
            config.retry_backoff_cap_ms(),
        )
    }

    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.max_attempts > 0
    }

    /// `attempt` は 1 始まり。無制限モードでは常に false。
    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        self.is_bounded() && attempt >= self.max_attempts
    }

    /// Delay before redelivering a message whose `attempt`-th delivery failed.
    ///
    /// Full jitter: uniform in `[0, min(cap, base * 2^(attempt-1))]`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponential = self
            .base_delay_ms
            .saturating_mul(1_u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
        let capped = exponential.min(self.max_delay_ms);

        let jittered = if capped > 0 {
            rand::rng().random_range(0..=capped)
        } else {
            0
        };
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_zero_is_zero() {
        assert_eq!(RetryPolicy::default().delay_after(0), Duration::ZERO);
    }

    #[test]
    fn delay_stays_within_exponential_bound() {
        let policy = RetryPolicy::new(5, 100, 10_000);

        for _ in 0..50 {
            assert!(policy.delay_after(1) <= Duration::from_millis(100));
            assert!(policy.delay_after(2) <= Duration::from_millis(200));
            assert!(policy.delay_after(3) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(100, 1_000, 5_000);

        for _ in 0..50 {
            assert!(policy.delay_after(20) <= Duration::from_millis(5_000));
            assert!(policy.delay_after(90) <= Duration::from_millis(5_000));
        }
    }

    #[test]
    fn final_attempt_detection() {
        let policy = RetryPolicy::new(3, 0, 0);

        assert!(!policy.is_final_attempt(1));
        assert!(!policy.is_final_attempt(2));
        assert!(policy.is_final_attempt(3));
        assert!(policy.is_final_attempt(4));
    }

    #[test]
    fn unbounded_policy_never_reaches_final_attempt() {
        let policy = RetryPolicy::unbounded();

        assert!(!policy.is_bounded());
        assert!(!policy.is_final_attempt(1_000));
        assert_eq!(policy.delay_after(7), Duration::ZERO);
    }
}
