//! Timeouts and bounded retries for upstream calls.
//!
//! Only idempotent reads go through [`retry_read`]. Mutations get a single
//! [`with_timeout`] attempt; the executor decides whether to try again after
//! checking exchange state.

use crate::domain::errors::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt deadline
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            ..Default::default()
        }
    }

    /// Exponential backoff with +-20% jitter, capped at `max_delay`
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((capped * jitter) as u64)
    }
}

/// Run `fut` with a deadline, mapping expiry to an `UpstreamError` timeout
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Upstream call timed out");
            Err(UpstreamError::timeout(operation))
        }
    }
}

/// Retry an idempotent read on transient failures
pub async fn retry_read<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match with_timeout(operation, policy.timeout, call()).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Read succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient upstream error, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
