use std::time::Duration;

/// Reconnect schedule for a realtime channel.
///
/// The first retry after a failure is immediate; retry `n >= 2` waits
/// `base_backoff * 2^(n-2)`, capped at `max_backoff`. After `max_attempts`
/// consecutive failures the channel gives up and stays offline. The counter
/// resets every time the channel reaches live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// attempt budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        if attempt == 1 {
            return Some(Duration::ZERO);
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        let delay = self.base_backoff.saturating_mul(factor);
        Some(delay.min(self.max_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_retry_is_immediate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::ZERO));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        let delays: Vec<u128> = (2..=7)
            .map(|n| policy.delay_for_attempt(n).unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_budget_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.delay_for_attempt(3).is_some());
        assert_eq!(policy.delay_for_attempt(4), None);
        assert_eq!(policy.delay_for_attempt(0), None);
    }

    #[test]
    fn test_huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for_attempt(200), Some(Duration::from_secs(30)));
    }
}
