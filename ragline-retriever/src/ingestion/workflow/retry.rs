//! Bounded exponential backoff for workflow steps.

use super::WorkflowError;
use crate::config::IngestionConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub rate: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IngestionConfig::default())
    }
}

impl RetryPolicy {
    /// A policy that runs the operation once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn from_config(config: &IngestionConfig) -> Self {
        Self {
            max_attempts: config.embed_max_attempts.max(1),
            initial_delay: Duration::from_millis(config.backoff_initial_ms),
            rate: config.backoff_rate,
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `initial * rate^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.rate.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or runs out of attempts. Returns the value and the attempts it took.
    ///
    /// The last error is returned unchanged when attempts run out, so the
    /// caller can still tell it was transient.
    pub async fn run<F, Fut, T>(&self, step: &str, mut operation: F) -> Result<(T, u32), WorkflowError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        step,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!(step, attempts = attempt, error = %err, "Retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}
