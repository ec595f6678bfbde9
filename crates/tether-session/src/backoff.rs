use std::time::Duration;

/// Exponential reconnect delay without jitter: `min(base * 2^n, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay to use after `current` has been waited out.
    pub fn next(&self, current: Duration) -> Duration {
        current.checked_mul(2).unwrap_or(self.max).min(self.max)
    }

    /// Delay before the `attempt`-th consecutive reconnect (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn doubles_until_cap() {
        let policy = BackoffPolicy::new(ms(2000), ms(60_000));
        let mut delay = policy.base;
        let mut seen = vec![delay];
        for _ in 0..7 {
            delay = policy.next(delay);
            seen.push(delay);
        }
        assert_eq!(
            seen,
            [2000, 4000, 8000, 16_000, 32_000, 60_000, 60_000, 60_000].map(ms)
        );
    }

    #[test]
    fn next_matches_closed_form() {
        let policy = BackoffPolicy::new(ms(100), ms(5000));
        let mut delay = policy.base;
        for n in 0..12 {
            assert_eq!(delay, policy.delay_for(n), "attempt {n}");
            delay = policy.next(delay);
        }
    }

    #[test]
    fn huge_attempt_saturates_at_max() {
        let policy = BackoffPolicy::new(ms(1000), ms(5000));
        assert_eq!(policy.delay_for(10), ms(5000));
        assert_eq!(policy.delay_for(200), ms(5000));
        assert_eq!(policy.next(Duration::MAX), ms(5000));
    }

    #[test]
    fn max_below_base_is_raised() {
        let policy = BackoffPolicy::new(ms(500), ms(100));
        assert_eq!(policy.max, ms(500));
        assert_eq!(policy.next(policy.base), ms(500));
    }
}
