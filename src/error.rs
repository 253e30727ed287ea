use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error("Operation called before initialize()")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Request handler timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Request handler failed: {0}")]
    Handler(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl CrawlError {
    /// Whether this failure participates in per-request retry accounting.
    ///
    /// Retryable errors are recorded on the request and the request is
    /// reclaimed; everything else either fails the request terminally or
    /// tears down the pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Storage(_)
                | CrawlError::TaskTimeout(_)
                | CrawlError::Handler(_)
                | CrawlError::Network(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CrawlError::InvalidUrl(_) => ErrorSeverity::Low,
            CrawlError::Handler(_) | CrawlError::TaskTimeout(_) => ErrorSeverity::Medium,
            CrawlError::Storage(_) | CrawlError::Network(_) => ErrorSeverity::Medium,
            CrawlError::NotInitialized | CrawlError::InvalidArgument(_) => ErrorSeverity::High,
            CrawlError::PayloadTooLarge(_) => ErrorSeverity::High,
            CrawlError::Serialization(_) => ErrorSeverity::High,
            CrawlError::Fatal(_) => ErrorSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for CrawlError {
    fn from(err: AcquireError) -> Self {
        CrawlError::Fatal(err.to_string())
    }
}

impl From<std::io::Error> for CrawlError {
    fn from(err: std::io::Error) -> Self {
        CrawlError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(err: serde_json::Error) -> Self {
        CrawlError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        CrawlError::Network(err.to_string())
    }
}
