//! Error taxonomy shared by every sampler and client.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, FeedError>;

/// `Clone` because one probe outcome fans out to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    /// Zero matches, or the requested page/item does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Any other 4xx: the request itself is wrong, retrying will not help.
    #[error("request rejected with status {status}")]
    Rejected { status: u16 },

    #[error("unexpected response body: {0}")]
    Decode(String),

    /// No configured source can currently produce items.
    #[error("no sources available: {0}")]
    SourcesUnavailable(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::RateLimited { .. } | FeedError::Transient(_))
    }

    /// Errors after which the offending source must not be called again.
    pub fn disables_source(&self) -> bool {
        matches!(self, FeedError::Auth(_) | FeedError::QuotaExceeded(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedError::NotFound(_) => "not_found",
            FeedError::RateLimited { .. } => "rate_limited",
            FeedError::Transient(_) => "transient",
            FeedError::Auth(_) => "auth",
            FeedError::QuotaExceeded(_) => "quota_exceeded",
            FeedError::Rejected { .. } => "rejected",
            FeedError::Decode(_) => "decode",
            FeedError::SourcesUnavailable(_) => "sources_unavailable",
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Decode(e.to_string())
        } else {
            FeedError::Transient(e.to_string())
        }
    }
}
