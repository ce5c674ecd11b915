//! Failure classification and exponential-backoff retry.
//!
//! Every failure falls in exactly one [`ErrorClass`]. Validation and
//! rate-limit failures are returned after a single attempt: throttling is
//! handled by waiting *before* a call, never by retrying after it. Retryable
//! and unclassified failures are retried up to `max_retries` times with a
//! delay of `base_delay * 2^(n-1)` before retry `n`, without jitter.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input; retrying cannot help.
    Validation,
    /// Upstream throttling (HTTP 429).
    RateLimited,
    /// Timeouts, 5xx, dropped connections.
    Retryable,
    /// Anything else. Upstream reads are idempotent, so these are retried.
    Unclassified,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable | ErrorClass::Unclassified)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Retryable => "retryable",
            ErrorClass::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

/// Errors that can be sorted into an [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry `n` (1-based): `base_delay * 2^(n-1)`.
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Run `op` until it succeeds, fails with a non-retryable class, or the
    /// attempt budget (`max_retries + 1`) is spent. The last error is
    /// returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.class();
                    if !class.is_retryable() {
                        tracing::debug!(attempt, %class, error = %err, "not retrying");
                        return Err(err);
                    }
                    if attempt >= max_attempts {
                        tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                        return Err(err);
                    }
                    let delay = self.delay_for_retry(attempt);
                    tracing::warn!(
                        attempt,
                        %class,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError(ErrorClass);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error ({})", self.0)
        }
    }

    impl Classify for TestError {
        fn class(&self) -> ErrorClass {
            self.0
        }
    }

    const BASE: Duration = Duration::from_millis(100);

    async fn run_failing(class: ErrorClass, max_retries: u32) -> (u32, Vec<Instant>) {
        let calls = AtomicU32::new(0);
        let stamps = Mutex::new(Vec::new());
        let policy = RetryPolicy::new(max_retries, BASE);
        let result: Result<(), TestError> = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                stamps.lock().unwrap().push(Instant::now());
                async move { Err(TestError(class)) }
            })
            .await;
        assert!(result.is_err());
        (calls.load(Ordering::SeqCst), stamps.into_inner().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_attempted_once() {
        let (calls, _) = run_failing(ErrorClass::Validation, 3).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_is_attempted_once() {
        let (calls, _) = run_failing(ErrorClass::RateLimited, 3).await;
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_uses_full_budget_with_doubling_delays() {
        let (calls, stamps) = run_failing(ErrorClass::Retryable, 3).await;
        assert_eq!(calls, 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![BASE, BASE * 2, BASE * 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn unclassified_is_retried() {
        let (calls, _) = run_failing(ErrorClass::Unclassified, 2).await;
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, BASE);
        let result = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError(ErrorClass::Retryable))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_is_returned_unchanged() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(1, BASE);
        let result: Result<(), TestError> = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(TestError(ErrorClass::Retryable))
                    } else {
                        Err(TestError(ErrorClass::Unclassified))
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap_err().0, ErrorClass::Unclassified);
    }

    #[test]
    fn delay_schedule() {
        let policy = RetryPolicy::new(5, BASE);
        assert_eq!(policy.delay_for_retry(1), BASE);
        assert_eq!(policy.delay_for_retry(2), BASE * 2);
        assert_eq!(policy.delay_for_retry(3), BASE * 4);
        assert_eq!(policy.delay_for_retry(40), BASE.saturating_mul(1 << 31));
    }

    #[test]
    fn class_retryability() {
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::Retryable.is_retryable());
        assert!(ErrorClass::Unclassified.is_retryable());
    }
}
