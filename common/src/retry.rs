use std::time::Duration;

/// Exponential backoff with an optional attempt budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Same wait after every attempt.
    pub const fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
            max_attempts,
        }
    }

    pub const fn exponential(
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2,
            max_attempts,
        }
    }

    /// How long to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Whether attempt number `attempt` (1-based) may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[test]
fn test_exponential_delays_are_capped() {
    let policy = RetryPolicy::exponential(
        Duration::from_millis(100),
        Duration::from_millis(1000),
        Some(10),
    );

    let delays: Vec<u64> = (1..=6)
        .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

    // Huge attempt numbers saturate instead of overflowing.
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(1000));
}

#[test]
fn test_fixed_delay() {
    let policy = RetryPolicy::fixed(Duration::from_millis(500), None);
    assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for(50), Duration::from_millis(500));
}

#[test]
fn test_attempt_budget() {
    let bounded = RetryPolicy::fixed(Duration::ZERO, Some(3));
    assert!(bounded.allows(1));
    assert!(bounded.allows(3));
    assert!(!bounded.allows(4));

    let unbounded = RetryPolicy::fixed(Duration::ZERO, None);
    assert!(unbounded.allows(u32::MAX));
}
