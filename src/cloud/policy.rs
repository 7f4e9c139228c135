use crate::error::CloudApiError;
use reqwest::StatusCode;
use std::time::Duration;

pub const BODY_PREVIEW_CHARS: usize = 300;

/// Maps a non-success HTTP status to a cloud error.
///
/// 429 and 5xx are transient, 404 is not-found, everything else is permanent.
pub fn classify_status(status: StatusCode, body: &str) -> CloudApiError {
    let detail = format!("{status}: {:.len$}", body, len = BODY_PREVIEW_CHARS);
    match status {
        StatusCode::TOO_MANY_REQUESTS => CloudApiError::RateLimited(detail),
        StatusCode::NOT_FOUND => CloudApiError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudApiError::PermissionDenied(detail),
        StatusCode::CONFLICT => CloudApiError::AlreadyExists(detail),
        s if s.is_server_error() => CloudApiError::Unavailable(detail),
        _ => CloudApiError::InvalidRequest(detail),
    }
}

/// Maps a transport failure. Timeouts and connection errors are transient.
pub fn classify_transport(err: &reqwest::Error, timeout: Duration) -> CloudApiError {
    if err.is_timeout() {
        CloudApiError::Timeout(timeout)
    } else if err.is_decode() {
        CloudApiError::Decode(err.to_string())
    } else if err.is_builder() {
        CloudApiError::InvalidRequest(err.to_string())
    } else {
        CloudApiError::Unavailable(err.to_string())
    }
}
