//! Sliding-window admission control for calls against a shared remote
//! provider.
//!
//! At most `max_calls` admissions are recorded inside any rolling `window`.
//! Admission checks are serialized through a semaphore sized `max_calls`; the
//! permit is released as soon as the admission decision is made, so the
//! semaphore bounds concurrent checks rather than in-flight calls.

use crate::error::{Result, StowageError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    permits: Semaphore,
    admitted: Mutex<VecDeque<Instant>>,
    disposed: AtomicBool,
}

enum Admission {
    Granted,
    RetryAfter(Duration),
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Result<Self> {
        if max_calls == 0 {
            return Err(StowageError::Config(
                "Rate limiter max_calls must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(StowageError::Config(
                "Rate limiter window must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            max_calls,
            window,
            permits: Semaphore::new(max_calls),
            admitted: Mutex::new(VecDeque::with_capacity(max_calls)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until the caller may issue one call.
    ///
    /// Returns `Cancelled` if the token fires first; an abandoned wait never
    /// records an admission.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            self.ensure_live()?;

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StowageError::Cancelled),
                permit = self.permits.acquire() => permit.map_err(|_| {
                    StowageError::InvalidState("Rate limiter has been disposed".to_string())
                })?,
            };

            if cancel.is_cancelled() {
                return Err(StowageError::Cancelled);
            }

            let decision = self.try_admit(Instant::now());
            drop(permit);

            match decision {
                Admission::Granted => return Ok(()),
                Admission::RetryAfter(wait) => {
                    log::debug!(
                        "Rate limit reached ({} calls per {:?}), waiting {:?}",
                        self.max_calls,
                        self.window,
                        wait
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StowageError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Number of admissions recorded inside the current window.
    pub fn current_count(&self) -> usize {
        let now = Instant::now();
        let admitted = self.lock_admitted();
        admitted
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) < self.window)
            .count()
    }

    /// Release the limiter. Any later `acquire` fails with `InvalidState`,
    /// and waiters blocked on the semaphore are woken with the same error.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.permits.close();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(StowageError::InvalidState(
                "Rate limiter has been disposed".to_string(),
            ));
        }
        Ok(())
    }

    fn try_admit(&self, now: Instant) -> Admission {
        let mut admitted = self.lock_admitted();

        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.max_calls {
            admitted.push_back(now);
            return Admission::Granted;
        }

        match admitted.front() {
            Some(oldest) => {
                let ages_out = *oldest + self.window;
                Admission::RetryAfter(ages_out.saturating_duration_since(now))
            }
            None => Admission::RetryAfter(Duration::ZERO),
        }
    }

    fn lock_admitted(&self) -> std::sync::MutexGuard<'_, VecDeque<Instant>> {
        // The queue holds plain timestamps, so a poisoned guard is still usable.
        self.admitted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(matches!(
            RateLimiter::new(0, Duration::from_secs(1)),
            Err(StowageError::Config(_))
        ));
        assert!(matches!(
            RateLimiter::new(5, Duration::ZERO),
            Err(StowageError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10)).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.current_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_call_waits_for_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupancy_drains_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.current_count(), 1);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(limiter.current_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_records_nothing() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)).unwrap());
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = waiter_cancel.clone();
            tokio::spawn(async move { limiter.acquire(&token).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        waiter_cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StowageError::Cancelled)));
        assert_eq!(limiter.current_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_dispose_is_invalid_state() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1)).unwrap();
        limiter.dispose();

        let result = limiter.acquire(&CancellationToken::new()).await;
        assert!(matches!(result, Err(StowageError::InvalidState(_))));
    }
}
