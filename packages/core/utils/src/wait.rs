use std::{future::Future, time::Duration};

use async_std::future::timeout;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{label} timed out after {after:?}")]
pub struct WaitTimeout {
    pub label: String,
    pub after: Duration,
}

/// Await `fut`, warning once if it takes longer than `warn_after` and giving
/// up after `limit` (when set).
pub async fn wait_complain<F: Future>(label: &str, warn_after: Duration, limit: Option<Duration>, fut: F) -> Result<F::Output, WaitTimeout> {
    let mut fut = Box::pin(fut);
    let first = match limit {
        Some(limit) if limit <= warn_after => {
            return timeout(limit, fut).await.map_err(|_| WaitTimeout { label: label.to_string(), after: limit });
        }
        _ => warn_after,
    };
    match timeout(first, &mut fut).await {
        Ok(res) => return Ok(res),
        Err(_) => log::warn!("[Wait] {} still pending after {:?}", label, warn_after),
    }
    match limit {
        Some(limit) => timeout(limit - warn_after, fut).await.map_err(|_| WaitTimeout { label: label.to_string(), after: limit }),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::wait_complain;

    #[async_std::test]
    async fn fast_future_completes() {
        let res = wait_complain("fast", Duration::from_millis(100), Some(Duration::from_millis(200)), async { 42 }).await;
        assert_eq!(res, Ok(42));
    }

    #[async_std::test]
    async fn slow_future_completes_after_warning() {
        let res = wait_complain("slow", Duration::from_millis(10), None, async {
            async_std::task::sleep(Duration::from_millis(50)).await;
            7
        })
        .await;
        assert_eq!(res, Ok(7));
    }

    #[async_std::test]
    async fn stuck_future_times_out() {
        let res = wait_complain("stuck", Duration::from_millis(10), Some(Duration::from_millis(40)), futures_pending()).await;
        let err = res.expect_err("should time out");
        assert_eq!(err.label, "stuck");
        assert_eq!(err.after, Duration::from_millis(40));
    }

    async fn futures_pending() -> u8 {
        std::future::pending::<u8>().await
    }
}
