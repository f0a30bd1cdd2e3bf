//! Retry with exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::metrics;

/// Attempt cap and backoff curve. The delay before retry `n` (1-based) is
/// `multiplier * 2^(n-1)`, clamped to `[min_delay, max_delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for graph node/edge upserts: 3 attempts, 4s..10s.
    pub const fn graph_mutation() -> Self {
        Self {
            max_attempts: 3,
            multiplier: Duration::from_secs(1),
            min_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(62) as i32;
        let raw = self.multiplier.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped).clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::graph_mutation()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt cap is reached. The last error is returned unchanged.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_retryable: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient failure: {}",
                    err
                );
                metrics::record_graph_retry(operation);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
