use super::IsRetryable;
use std::time::Duration;
use thiserror::Error as ThisError;

/// Failure of one call against the cloud API.
///
/// Transient variants (rate limit, unavailability, per-call timeout) are retried with backoff by
/// the mapper layer; permanent ones surface immediately.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CloudApiError {
    #[error("cloud API rate limited: {0}")]
    RateLimited(String),

    #[error("cloud API unavailable: {0}")]
    Unavailable(String),

    #[error("cloud API call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cloud API rejected the request: {0}")]
    InvalidRequest(String),

    #[error("cloud API permission denied: {0}")]
    PermissionDenied(String),

    #[error("cloud object already exists: {0}")]
    AlreadyExists(String),

    #[error("cloud object not found: {0}")]
    NotFound(String),

    #[error("unexpected cloud API payload: {0}")]
    Decode(String),
}

impl CloudApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudApiError::NotFound(_))
    }
}

impl IsRetryable for CloudApiError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudApiError::RateLimited(_) | CloudApiError::Unavailable(_) | CloudApiError::Timeout(_)
        )
    }
}
