use crate::error::{Result, StowageError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Capped exponential backoff around a fallible async operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Result<Self> {
        if !backoff_multiplier.is_finite() || backoff_multiplier <= 0.0 {
            return Err(StowageError::Config(format!(
                "Backoff multiplier must be positive, got {}",
                backoff_multiplier
            )));
        }

        Ok(Self {
            max_retries,
            initial_delay,
            backoff_multiplier,
            max_delay,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Fatal errors and cancellation are returned as-is after the first
    /// occurrence. When all retries are spent the last error is wrapped in
    /// `RetriesExhausted`.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(StowageError::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() || !err.is_transient() {
                return Err(err);
            }

            if attempt >= self.max_retries {
                log::warn!(
                    "Giving up after {} attempts: {}",
                    attempt + 1,
                    err
                );
                return Err(StowageError::RetriesExhausted {
                    attempts: attempt + 1,
                    source: Box::new(err),
                });
            }

            attempt += 1;
            let delay = self.delay_for(attempt);
            log::warn!(
                "Transient failure (retry {}/{}), retrying in {:?}: {}",
                attempt,
                self.max_retries,
                delay,
                err
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StowageError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_non_positive_multiplier() {
        let result = RetryPolicy::new(3, Duration::from_millis(10), 0.0, Duration::from_secs(1));
        assert!(matches!(result, Err(StowageError::Config(_))));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_invoked_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);

        let result: Result<()> = policy
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StowageError::Config("broken".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(StowageError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);

        let result = policy
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(StowageError::Network("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(2);

        let result: Result<()> = policy
            .execute(&CancellationToken::new(), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StowageError::Timeout("request".to_string()))
                }
            })
            .await;

        match result {
            Err(StowageError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, StowageError::Timeout(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(60),
            2.0,
            Duration::from_secs(600),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<()> = policy
            .execute(&cancel, || {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Err(StowageError::Network("down".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(StowageError::Cancelled)));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(
            initial_ms in 1u64..5_000,
            multiplier in 0.5f64..10.0,
            cap_ms in 1u64..60_000,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy::new(
                10,
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(cap_ms),
            ).unwrap();
            prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(cap_ms));
        }
    }
}
