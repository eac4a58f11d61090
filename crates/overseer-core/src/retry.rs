use std::time::Duration;

/// Exponential backoff schedule for transport-class failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_attempts: u32,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn sandbox_default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2,
            max_attempts: 3,
            cap: Duration::from_secs(4),
        }
    }

    /// Delay to wait after the given failed attempt (1-based). `None` when the budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let multiplier = self.factor.saturating_pow(attempt - 1).max(1);
        let delay = self.base.saturating_mul(multiplier);
        Some(delay.min(self.cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sandbox_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_schedule_doubles_then_stops() {
        let policy = RetryPolicy::sandbox_default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            factor: 10,
            max_attempts: 6,
            cap: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(5), Some(Duration::from_secs(4)));
    }
}
