//! Explicit retry policy for analysis tasks.

use crate::config::RetryConfig;
use crate::error::ProviderError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate = Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>;

/// Attempt ceiling, backoff schedule and retryable-error predicate.
///
/// Passed to the engine per phase rather than attached to call sites.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    predicate: RetryPredicate,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier,
            predicate: Arc::new(ProviderError::is_retryable),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.multiplier,
        )
    }

    /// Single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Replace the retryable-error classification.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ProviderError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, err: &ProviderError) -> bool {
        (self.predicate)(err)
    }

    /// Whether a task that just failed its `attempt`-th attempt gets another.
    pub fn should_retry(&self, err: &ProviderError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.is_retryable(err)
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);
        if capped_ms.is_finite() && capped_ms > 0.0 {
            Duration::from_millis(capped_ms.round() as u64)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}
