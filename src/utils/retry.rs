use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::metrics::Metrics;

// ============================================================================
// Retry with exponential backoff
// ============================================================================
//
// Only errors classified as transient are retried. Caller errors surface on
// the first attempt so a bad request is never replayed against the ledger.
//
// ============================================================================

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64);
        scaled.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt
/// budget is spent. The last error is returned unchanged.
pub async fn retry_transient<F, Fut, T, E>(
    policy: &RetryPolicy,
    label: &str,
    metrics: Option<&Metrics>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;
        if let Some(metrics) = metrics {
            metrics
                .retry_attempts_total
                .with_label_values(&[label])
                .inc();
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_transient() => {
                tracing::debug!(operation = label, error = %error, "Permanent failure, not retrying");
                return Err(error);
            }
            Err(error) if attempt >= policy.max_attempts => {
                tracing::error!(operation = label, attempt, error = %error, "Giving up after all attempts");
                if let Some(metrics) = metrics {
                    metrics.retry_exhausted_total.with_label_values(&[label]).inc();
                }
                return Err(error);
            }
            Err(error) => {
                tracing::warn!(
                    operation = label,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );
                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl IsTransient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_transient(&fast(3), "test", None, |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(true))
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
    async fn test_permanent_failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Flaky> = retry_transient(&fast(5), "test", None, |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_respected_and_counted() {
        let metrics = Metrics::new().unwrap();
        let result: Result<(), Flaky> =
            retry_transient(&fast(2), "publish", Some(&metrics), |_| async { Err(Flaky(true)) }).await;

        assert!(result.is_err());
        assert_eq!(metrics.retry_attempts_total.with_label_values(&["publish"]).get(), 2);
        assert_eq!(metrics.retry_exhausted_total.with_label_values(&["publish"]).get(), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = fast(3);
        assert_eq!(policy.next_delay(Duration::from_millis(4)), Duration::from_millis(5));
        assert_eq!(RetryPolicy::with_attempts(0).max_attempts, 1);
    }
}
