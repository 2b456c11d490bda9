use crate::error::Error;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// A per-endpoint circuit breaker (closed / open / half-open). Never
/// shared across endpoints — construct one per remote target (a VMM
/// socket, a guest vsock connection, the registry).
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout_ms: u64,
    half_open_success_threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout_ms: u64, half_open_success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms,
            half_open_success_threshold,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Forces the breaker back to `Closed`, clearing all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_half_open_successes = 0;
        inner.opened_at = None;
    }

    /// Checks admission before a call. Transitions `Open -> HalfOpen` once
    /// `reset_timeout_ms` has elapsed, admitting the call that triggers it.
    fn admit(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                let elapsed_ms = elapsed.as_millis() as u64;
                if elapsed_ms >= self.reset_timeout_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_half_open_successes = 0;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        retry_after_ms: self.reset_timeout_ms.saturating_sub(elapsed_ms),
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.consecutive_half_open_successes += 1;
                if inner.consecutive_half_open_successes >= self.half_open_success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_half_open_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Runs `f` through the breaker: fails fast with `CircuitOpen` if the
    /// breaker is open, otherwise runs `f` and records the outcome.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.admit()?;
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_exactly_failure_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, 100, 2);
        for _ in 0..3 {
            let _ = breaker
                .call(|| async { Err::<(), _>(Error::Timeout("x".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let err = breaker
            .call(|| async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        match err {
            Error::CircuitOpen { retry_after_ms } => assert!(retry_after_ms <= 100),
            _ => panic!("expected CircuitOpen"),
        }
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_and_reopens_on_failure() {
        let breaker = CircuitBreaker::new(3, 50, 2);
        for _ in 0..3 {
            let _ = breaker
                .call(|| async { Err::<(), _>(Error::Timeout("x".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        breaker.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn one_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new(1, 10, 5);
        let _ = breaker
            .call(|| async { Err::<(), _>(Error::Timeout("x".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = breaker
            .call(|| async { Err::<(), _>(Error::Timeout("still down".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = CircuitBreaker::new(1, 10_000, 1);
        let _ = breaker
            .call(|| async { Err::<(), _>(Error::Timeout("x".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }
}
