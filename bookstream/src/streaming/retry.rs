//! Retry policy for recoverable loading failures.

use std::time::Duration;

/// How many times a failed session is restarted, and how long to wait.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    None,

    /// Constant delay between retries.
    Fixed {
        /// Retries after the initial attempt.
        max_retries: u32,
        delay: Duration,
    },

    /// The n-th retry waits `n * step`.
    Linear {
        /// Retries after the initial attempt.
        max_retries: u32,
        step: Duration,
    },
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    pub fn linear(max_retries: u32, step: Duration) -> Self {
        Self::Linear { max_retries, step }
    }

    /// Delay before retry number `retry` (1-based), `None` once retries are spent.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Linear { step, .. } => Some(step.saturating_mul(retry)),
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::Linear { max_retries, .. } => *max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::None;
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.delay_for_retry(1), None);
    }

    #[test]
    fn test_retry_policy_linear() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_retry(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_retry(3), Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for_retry(4), None);
    }

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(policy.delay_for_retry(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for_retry(3), None);
    }
}
