//! Retry and timeout combinators.
//!
//! The pipelines have exactly two retry shapes: the LLM client's fixed-sleep
//! loop and the intent-aggregation exponential backoff with jitter. Both are
//! expressed through [`RetryPolicy`] so call sites stay declarative.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Declarative retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff: f64,
    /// Fraction of the delay added as uniform random jitter.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Fixed-interval policy: `attempts` tries, `delay` between each.
    #[must_use]
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            base_delay: delay,
            backoff: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential policy with 10% jitter, the shape used by intent
    /// aggregation (base × 1.5^n).
    #[must_use]
    pub const fn exponential(attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            base_delay,
            backoff: 1.5,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff.powi(retry.try_into().unwrap_or(i32::MAX));
        let jitter = if self.jitter > 0.0 {
            scaled * self.jitter * fastrand::f64()
        } else {
            0.0
        };
        Duration::from_secs_f64(scaled + jitter)
    }
}

/// Run `op` under `policy`, retrying on any error the `retryable` predicate
/// accepts. The final error is returned unchanged once attempts run out or
/// the predicate rejects it.
pub async fn retry<T, E, F, Fut, P>(policy: RetryPolicy, retryable: P, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !retryable(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure",
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Bound `op` to a wall-clock duration; elapsing yields [`Error::Timeout`].
pub async fn with_timeout<T, Fut>(duration: Duration, op: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, op).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            secs: duration.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: std::result::Result<u32, String> = retry(policy, |_| true, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err("transient".to_owned()) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: std::result::Result<(), String> =
            retry(policy, |e: &String| e != "terminal", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("terminal".to_owned())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { secs: 0 })));
    }

    #[test]
    fn exponential_delays_grow() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(2));
        assert!(policy.delay_for(0) >= Duration::from_secs(2));
        assert!(policy.delay_for(3) >= policy.delay_for(1));
    }
}
