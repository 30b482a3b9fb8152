use market_feed_core::StoreError;
use thiserror::Error;

/// A failed call to the market data API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl UpstreamError {
    /// HTTP status of an API error, if the upstream answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Api { status, .. } => Some(*status),
            UpstreamError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A failed sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}
