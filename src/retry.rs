//! Reconnection policies

use std::time::Duration;

/// Strategy supplying the delay before each reconnection attempt.
///
/// `attempt` is zero-based and resets after every successful connection.
/// Returning `None` ends the retry loop and surfaces the last error.
pub trait RetryPolicy: Send + Sync {
    fn delay(&self, attempt: usize) -> Option<Duration>;
}

/// Sleeps through a fixed, ordered sequence of delays, then gives up.
#[derive(Debug, Clone)]
pub struct IntervalRetryPolicy {
    delays: Vec<Duration>,
}

impl IntervalRetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Convenience constructor from whole seconds.
    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for IntervalRetryPolicy {
    fn default() -> Self {
        Self::from_secs(&[1, 2, 4, 8, 16])
    }
}

impl RetryPolicy for IntervalRetryPolicy {
    fn delay(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }
}

/// Retries forever with no delay between attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedRetryPolicy;

impl RetryPolicy for UnboundedRetryPolicy {
    fn delay(&self, _attempt: usize) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_walks_sequence() {
        let policy = IntervalRetryPolicy::from_secs(&[1, 2, 4]);
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay(3), None);
    }

    #[test]
    fn test_interval_default_sequence() {
        let policy = IntervalRetryPolicy::default();
        let secs: Vec<u64> = policy.delays().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_interval_empty_gives_up_immediately() {
        let policy = IntervalRetryPolicy::new(vec![]);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn test_unbounded_never_gives_up() {
        let policy = UnboundedRetryPolicy;
        assert_eq!(policy.delay(0), Some(Duration::ZERO));
        assert_eq!(policy.delay(10_000), Some(Duration::ZERO));
    }
}
