use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::AggregatorConfig;
use crate::errors::{AppError, AppResult};

/// Bounded retry with exponential, capped, jitter-free backoff. Fatal errors
/// (auth, malformed request) are surfaced immediately; only errors the
/// taxonomy classifies as transient are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.retry_base_backoff_ms),
            Duration::from_millis(config.retry_max_backoff_ms),
        )
    }

    /// Delay before the next attempt: `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(self.max_backoff)
    }

    /// Run `operation` up to `max_attempts` times, each attempt bounded by
    /// `per_attempt`. A timed-out attempt counts as a retryable failure, not
    /// a fatal one.
    pub async fn execute<T, F, Fut>(
        &self,
        op_name: &str,
        per_attempt: Duration,
        mut operation: F,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match timeout(per_attempt, operation()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(per_attempt.as_millis() as u64)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        ?err,
                        attempt,
                        op = op_name,
                        "retryable failure; backing off {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_millis(4_000))
    }
}
