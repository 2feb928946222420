// SPDX-License-Identifier: MPL-2.0

//! Retry with backoff (§4.5).

use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Clone)]
pub enum Backoff {
    /// `initial_delay * factor.powi(attempt - 1)`.
    Exponential(f64),
    /// `initial_delay + step * (attempt - 1)`.
    Linear(Duration),
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backoff::Exponential(factor) => f.debug_tuple("Exponential").field(factor).finish(),
            Backoff::Linear(step) => f.debug_tuple("Linear").field(step).finish(),
        }
    }
}

/// A retry policy attached to a [`crate::command::Command`].
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub growth: Backoff,
    /// Only retry when this returns true for the error of the failed attempt.
    /// Absent means "retry any error".
    pub retry_if: Option<Arc<dyn Fn(&Error) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("growth", &self.growth)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_delay,
            growth: Backoff::Exponential(2.0),
            retry_if: None,
        }
    }

    pub fn linear(mut self, step: Duration) -> Self {
        self.growth = Backoff::Linear(step);
        self
    }

    pub fn exponential(mut self, factor: f64) -> Self {
        self.growth = Backoff::Exponential(factor);
        self
    }

    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Delay to wait *before* making attempt number `attempt` (1-indexed,
    /// so `attempt == 1` is the delay before the first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.growth {
            Backoff::Exponential(factor) => {
                let scale = factor.powi((attempt - 1) as i32).max(0.0);
                self.initial_delay.mul_f64(scale)
            }
            Backoff::Linear(step) => self.initial_delay + step * (attempt - 1),
        }
    }

    pub fn should_retry(&self, error: &Error) -> bool {
        self.retry_if.as_ref().map_or(true, |f| f(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_grows() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).exponential(2.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn linear_backoff_grows() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(100)).linear(Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
    }
}
