//! Retry wrapper for retryable provider failures.
//!
//! Retry is explicit: an operation returns `Result`, and the caller wraps
//! it with a policy. Only errors the classifier marks retryable are
//! retried; everything else surfaces immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// delay, 2×delay, 3×delay, …
    Linear,
    /// delay, 2×delay, 4×delay, …
    Exponential,
}

/// A bounded retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Delay growth.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(500), backoff: Backoff::Exponential }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based; attempt 1 has no delay).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Linear => self.base_delay * (attempt - 1),
            Backoff::Exponential => self.base_delay * 2u32.saturating_pow(attempt - 2),
        }
    }
}

/// Run `op` under `policy`, retrying retryable [`ProviderError`]s.
///
/// A rate-limit error with a server-suggested `retry_after` overrides the
/// computed delay for that attempt.
///
/// # Errors
///
/// Returns the final error once attempts are exhausted, or the first
/// non-retryable error immediately.
pub async fn retry_with_policy<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = match &err {
                    ProviderError::RateLimit { retry_after: Some(after) } => *after,
                    _ => policy.delay_before(attempt + 1),
                };
                tracing::debug!(attempt, ?delay, error = %err, "retrying provider call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_before(4), Duration::from_millis(2000));
    }

    #[test]
    fn linear_delays_grow_by_base() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            base_delay: Duration::from_secs(1),
            max_attempts: 3,
        };
        assert_eq!(policy.delay_before(2), Duration::from_secs(1));
        assert_eq!(policy.delay_before(3), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_policy(RetryPolicy::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::ServiceUnavailable("503".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Authentication("bad key".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::RateLimit { retry_after: None }) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), ProviderError::RateLimit { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
