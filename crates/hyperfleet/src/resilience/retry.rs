use crate::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Retry configuration. The delay sequence is driven by
/// [`tokio_retry::strategy::ExponentialBackoff`] (doubling each attempt,
/// capped at `max_delay_ms`), optionally passed through
/// [`tokio_retry::strategy::jitter`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryOptions {
    fn strategy(&self) -> impl Iterator<Item = Duration> + '_ {
        let backoff = ExponentialBackoff::from_millis(2)
            .factor(self.initial_delay_ms.max(1))
            .max_delay(Duration::from_millis(self.max_delay_ms));
        let retries = self.max_attempts.saturating_sub(1) as usize;
        backoff.map(move |d| if self.jitter { jitter(d) } else { d }).take(retries)
    }
}

/// Attempts `f` up to `opts.max_attempts` times, sleeping between attempts
/// according to `opts`'s backoff strategy. `retry_on` short-circuits on
/// non-retryable errors; when it returns `false` the last error is
/// returned immediately without sleeping.
pub async fn with_retry<F, Fut, T>(
    opts: &RetryOptions,
    mut retry_on: impl FnMut(&Error) -> bool,
    mut f: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    RetryIf::spawn(opts.strategy(), || f(), |err: &Error| retry_on(err)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_two_failures_within_three_attempts() {
        let calls = AtomicU32::new(0);
        let opts = RetryOptions {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 1_000,
            jitter: false,
        };

        let result = with_retry(&opts, |_| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::Timeout("not yet".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_when_retry_on_rejects() {
        let calls = AtomicU32::new(0);
        let opts = RetryOptions::default();

        let result: Result<(), Error> = with_retry(&opts, |_| false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Validation("bad input".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_all_attempts_and_returns_the_last_error() {
        let calls = AtomicU32::new(0);
        let opts = RetryOptions { max_attempts: 4, initial_delay_ms: 1, max_delay_ms: 10, jitter: false };

        let result: Result<(), Error> = with_retry(&opts, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout("still down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn delay_never_exceeds_max_delay_ms() {
        let opts = RetryOptions { max_attempts: 6, initial_delay_ms: 50, max_delay_ms: 200, jitter: false };
        let delays: Vec<Duration> = opts.strategy().collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(200)));
    }
}
