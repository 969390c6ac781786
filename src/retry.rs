//! Retry policy configuration.

use std::time::Duration;

/// Policy for rescheduling tasks whose attempt failed with a retryable error.
///
/// `allowed_retries` bounds the attempt count: once a task's `try_count`
/// reaches it, the next retryable failure is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// No retries - the first failure completes the task.
    None,

    /// Fixed delay between attempts.
    Fixed {
        /// Attempt budget.
        allowed_retries: u32,
        /// Delay added to the finish time to compute the next `run_at`.
        interval: Duration,
    },

    /// Exponential backoff between attempts.
    Exponential {
        /// Attempt budget.
        allowed_retries: u32,
        /// Delay after the first failed attempt (doubles each attempt).
        initial_interval: Duration,
        /// Maximum delay cap.
        max_interval: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Create a fixed delay policy.
    pub fn fixed(allowed_retries: u32, interval: Duration) -> Self {
        Self::Fixed {
            allowed_retries,
            interval,
        }
    }

    /// Create an exponential backoff policy with sensible defaults.
    ///
    /// - Initial interval: 1 second
    /// - Max interval: 5 minutes
    pub fn exponential(allowed_retries: u32) -> Self {
        Self::Exponential {
            allowed_retries,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
        }
    }

    /// Delay before the next attempt, given the number of attempts made so far.
    ///
    /// Returns `None` if the budget is spent and the task must complete.
    pub fn retry_delay(&self, try_count: u32) -> Option<Duration> {
        if try_count >= self.allowed_retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { interval, .. } => Some(*interval),
            Self::Exponential {
                initial_interval,
                max_interval,
                ..
            } => {
                // 2^(try_count-1) * initial_interval, capped at max_interval
                let multiplier = 2u32.saturating_pow(try_count.saturating_sub(1));
                let delay = initial_interval.saturating_mul(multiplier);
                Some(delay.min(*max_interval))
            }
        }
    }

    /// Returns the attempt budget.
    pub fn allowed_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed {
                allowed_retries, ..
            } => *allowed_retries,
            Self::Exponential {
                allowed_retries, ..
            } => *allowed_retries,
        }
    }
}
