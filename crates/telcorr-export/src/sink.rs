//! The capability every summary destination implements

use async_trait::async_trait;
use std::time::Duration;
use telcorr_core::CorrelationSummary;
use thiserror::Error;

/// Sink error type
#[derive(Error, Debug)]
pub enum SinkError {
    /// Worth retrying (network blip, 5xx, busy backend)
    #[error("Transient sink failure: {0}")]
    Transient(String),

    /// Retrying cannot help (rejected payload, 4xx, bad configuration)
    #[error("Permanent sink failure: {0}")]
    Permanent(String),

    #[error("Sink call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "webhook")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl SinkError {
    /// Whether a retry of the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transient(_) | SinkError::Timeout(_) | SinkError::Io(_) => true,
            #[cfg(feature = "webhook")]
            SinkError::Network(_) => true,
            // 4xx will fail the same way again, except throttling
            SinkError::Http { status, .. } => !(400..500).contains(status) || *status == 429,
            SinkError::Permanent(_) | SinkError::Serialization(_) => false,
        }
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for correlation summaries
///
/// Called once per closed window with every summary of that window.
#[async_trait]
pub trait SummarySink: Send + Sync {
    /// Unique sink name; dead letters are tagged with it
    fn name(&self) -> &str;

    async fn export_summaries(&self, summaries: &[CorrelationSummary]) -> SinkResult<()>;

    /// Flush buffered output
    async fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(SinkError::Transient("reset".to_string()).is_retryable());
        assert!(SinkError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SinkError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(SinkError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!SinkError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!SinkError::Permanent("schema".to_string()).is_retryable());
    }
}
