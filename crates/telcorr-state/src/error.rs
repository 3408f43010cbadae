//! Error types for telcorr-state

use thiserror::Error;

/// Errors reported by a state backend
#[derive(Debug, Error)]
pub enum StateError {
    /// Database error (sqlite backend)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend task failed or is unavailable
    #[error("State backend unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Whether retrying the operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StateError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StateError::Unavailable(_) | StateError::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type for state operations
pub type StateResult<T> = Result<T, StateError>;
