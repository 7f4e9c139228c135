use crate::config::RetryConfig;
use crate::error::{CloudApiError, IsRetryable};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub fn retry_policy(cfg: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(cfg.min_delay_ms))
        .with_max_delay(Duration::from_millis(cfg.max_delay_ms.max(cfg.min_delay_ms)))
        .with_max_times(cfg.max_times)
        .with_jitter()
}

/// Runs `op`, retrying transient cloud errors with backoff.
pub async fn with_retry<T, F, Fut>(
    policy: ExponentialBuilder,
    action: &str,
    entity_type: &str,
    op: F,
) -> Result<T, CloudApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudApiError>>,
{
    op.retry(policy)
        .when(|err: &CloudApiError| err.is_retryable())
        .notify(|err, dur: Duration| {
            warn!(
                entity_type,
                action,
                error = %err,
                "cloud call retrying in {:?}",
                dur
            );
        })
        .await
}

/// Bounds one cloud call. Expiry surfaces as a retryable [`CloudApiError::Timeout`].
pub async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, CloudApiError>>,
) -> Result<T, CloudApiError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(CloudApiError::Timeout(limit)))
}
