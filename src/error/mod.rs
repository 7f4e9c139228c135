mod cloud;
mod cloudrow;

pub use cloud::CloudApiError;
pub use cloudrow::{CloudrowError, RecordFailure};

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl From<figment::Error> for CloudrowError {
    fn from(e: figment::Error) -> Self {
        CloudrowError::Config(Box::new(e))
    }
}
