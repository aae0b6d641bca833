//! Retry with exponential backoff for upstream calls

use census_common::{CensusError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default delay before the first retry
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound of the multiplicative jitter added to each delay
const JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, stretched by up to 10%.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let base = self.initial_backoff.as_secs_f64() * f64::from(1u32 << exponent);
        let jitter = rand::thread_rng().gen_range(0.0..JITTER);
        Duration::from_secs_f64(base * (1.0 + jitter))
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    ///
    /// `call` is invoked once per attempt, so each attempt re-enters the worker
    /// pool and backoff sleeps never hold a slot. On exhaustion the last error is
    /// returned inside [`CensusError::RetriesExhausted`] with the attempt count.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt > self.max_retries => {
                    error!(operation, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(CensusError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                },
                Err(e) => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_retries + 1,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}
