//! Retry with exponential backoff for provider calls.

use crate::payments::error::{PaymentError, PaymentResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Outcome of a retried call along with every failed attempt, so callers can
/// write each round-trip to the audit trail.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: PaymentResult<T>,
    pub failed_attempts: Vec<PaymentError>,
}

impl<T> RetryOutcome<T> {
    /// Total calls made, including the one that produced `result`.
    pub fn attempts(&self) -> usize {
        self.failed_attempts.len() + 1
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay slept after the given (1-based) failed attempt: 1s, 2s, 4s, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PaymentResult<T>>,
    {
        let mut failed_attempts = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        failed_attempts,
                    }
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    if !retryable || attempt >= self.max_attempts {
                        return RetryOutcome {
                            result: Err(e),
                            failed_attempts,
                        };
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = label,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    failed_attempts.push(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::ProviderErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_schedule_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = RetryPolicy::default()
            .run("test", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PaymentError::NetworkError {
                            message: "timeout".to_string(),
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.failed_attempts.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = RetryPolicy::default()
            .run("test", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PaymentError::provider(
                        "kbzpay",
                        ProviderErrorCode::ProviderBusy,
                        "busy",
                    ))
                }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = RetryPolicy::default()
            .run("test", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PaymentError::provider(
                        "kbzpay",
                        ProviderErrorCode::InsufficientBalance,
                        "no funds",
                    ))
                }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.failed_attempts.is_empty());
    }
}
