//! 集群调用的有界重试

use std::future::Future;

use taskhub_core::backoff::RetryPolicy;
use taskhub_core::HubResult;
use tracing::warn;

/// 执行 `f`，对可重试错误按策略退避重试，其余错误立即返回
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HubResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    "{} 失败（第 {} 次），{}ms 后重试: {}",
                    operation,
                    attempt + 1,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use taskhub_core::HubError;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_interval_ms: 1,
            max_interval_ms: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "create_pod", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HubError::Cluster("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: HubResult<()> = with_retry(&fast_policy(), "get_pod", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HubError::Cluster("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation() {
        let calls = AtomicU32::new(0);
        let result: HubResult<()> = with_retry(&fast_policy(), "lookup", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HubError::AddonNotFound("x".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
