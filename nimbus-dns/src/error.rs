//! Error types for the DNS proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No upstream endpoint is configured
    #[error("no upstream endpoint available")]
    NoUpstream,

    /// Upstream request failed at the transport level (timeout, connect, body)
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Upstream answered with a non-2xx status
    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(reqwest::StatusCode),

    /// Upstream body could not be decoded as a DNS message
    #[error("upstream decode error: {0}")]
    Decode(String),

    /// Bootstrap resolution failed; callers fall back to the original URL
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error should count against an upstream's health
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::UpstreamStatus(_) | Error::Decode(_)
        )
    }
}
