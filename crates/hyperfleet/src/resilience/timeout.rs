use crate::error::Error;
use std::future::Future;
use std::time::Duration;

/// Resolves with `future`'s result, or fails `Timeout` if `ms` elapses
/// first. Cancels (drops) the underlying future on the timeout path, which
/// is the only work needed to "cancel a timer" in `tokio::time::timeout`'s
/// model.
pub async fn with_timeout<F, T>(future: F, ms: u64, msg: Option<&str>) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(Duration::from_millis(ms), future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(
            msg.map(str::to_string)
                .unwrap_or_else(|| format!("deadline of {ms}ms exceeded")),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_when_future_finishes_in_time() {
        let result = with_timeout(async { Ok::<_, Error>(42) }, 1_000, None).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_timeout_when_future_is_too_slow() {
        let result = with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Error>(())
            },
            10,
            Some("too slow"),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
