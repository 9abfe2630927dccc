use std::fmt;
use std::future::Future;
use std::time;

use tracing::warn;

/// Errors that can tell whether trying the same call again might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded retry with a linear backoff, used for every call to the dataset API.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    max_attempts: u32,
    /// Attempt `n` waits `(n - 1) * backoff_unit` before it starts.
    backoff_unit: time::Duration,
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as a single attempt.
    pub fn new(max_attempts: u32, backoff_unit: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time to wait before the given 1-based attempt.
    pub fn time_until_attempt(&self, attempt: u32) -> time::Duration {
        self.backoff_unit * attempt.saturating_sub(1)
    }

    /// Run `call` until it succeeds, fails with a non retryable error or the
    /// attempts run out. The error of the last attempt is returned as is.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempt = 1;
        loop {
            let wait = self.time_until_attempt(attempt);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "retryable failure: {}",
                        error
                    );
                    metrics::counter!("dimension_extractor_request_retries_total", "operation" => operation.to_owned())
                        .increment(1);
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_unit: time::Duration::from_secs(10),
        }
    }
}
