//! Error taxonomy for the cache engine.
//!
//! Only internal seams return these. The public facade and preloader
//! operations degrade to the best available value instead of failing.

use std::time::Duration;

use thiserror::Error;

use crate::cache::compressor::CompressionError;

#[derive(Error, Debug)]
pub enum CacheError {
    /// A single provider in the source chain failed. Non-fatal, the chain continues.
    #[error("Source {provider} unavailable: {reason}")]
    SourceUnavailable { provider: String, reason: String },

    /// Persisted payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable write would exceed the mirror's storage quota.
    #[error("Durable storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// A bounded operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    TimeoutExceeded(Duration),

    /// The durable store is disabled in this environment.
    #[error("Durable storage is disabled")]
    StorageDisabled,

    /// Non-2xx response from a remote endpoint.
    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CacheError {
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        CacheError::SourceUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error means "this provider could not answer" (timeouts count).
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            CacheError::SourceUnavailable { .. }
                | CacheError::TimeoutExceeded(_)
                | CacheError::HttpStatus { .. }
                | CacheError::Http(_)
        )
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_counts_as_source_failure() {
        assert!(CacheError::TimeoutExceeded(Duration::from_secs(5)).is_source_failure());
        assert!(CacheError::unavailable("remote", "down").is_source_failure());
        assert!(!CacheError::StorageDisabled.is_source_failure());
    }
}
