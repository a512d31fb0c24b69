//! # Retry
//!
//! Exponential backoff shared by the source reconnect loop, per-event retries
//! and persistence job retries.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Backoff parameters: the `n`th retry waits `initial_interval * backoff_coefficient^n`,
/// capped at `maximum_interval`.
pub struct RetryPolicy {
    /// Multiplier applied once per attempt.
    pub backoff_coefficient: u32,
    /// The base interval scaled by the coefficient.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the interval to wait before retry number `attempt` (starting at 1).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (Some(candidate), None) => candidate,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(30)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
