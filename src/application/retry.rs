// Retry policy: exponential backoff with jitter for transient repository failures

use crate::error::{PaymentProcessError, RepositoryError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry following `attempt` (zero based).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Runs `operation` until it succeeds, fails permanently, or the retries run out.
    ///
    /// Only `RepositoryError::Transient` is retried. Cancelling `cancel` aborts
    /// the wait between attempts.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: F,
        operation_name: &str,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, RepositoryError>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_delay(attempt - 1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = self.config.max_retries,
                    ?delay,
                    "retrying repository call"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PaymentProcessError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(operation = operation_name, attempt, "repository call recovered");
                    }
                    return Ok(result);
                }
                Err(e) if Self::is_retryable_error(&e) => {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "transient repository failure"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(operation = operation_name, error = %e, "non-retryable repository failure");
                    return Err(e.into());
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RepositoryError::Backend(format!("{operation_name}: retries exhausted")))
            .into())
    }

    fn is_retryable_error(error: &RepositoryError) -> bool {
        error.is_transient()
    }
}
