//! telcorr state - correlation state carried across windows
//!
//! A correlation that spans several windows is stitched together through a
//! [`StateManager`]: every closed window folds its summaries into a
//! [`StateEntry`] keyed by the stable correlation id.
//!
//! ## Backends
//!
//! - [`MemoryStateManager`] - process-local map with TTL deadlines
//! - [`SqliteStateManager`] - SQLite file shared by several engine processes

pub mod entry;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use entry::StateEntry;
pub use error::{StateError, StateResult};
pub use memory::MemoryStateManager;
pub use sqlite::SqliteStateManager;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use telcorr_core::config::StateSettings;
use telcorr_core::CorrelationSummary;

/// Key-value store for correlation state with per-entry TTL
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Fetch a live entry; expired entries read as absent
    async fn get(&self, correlation_id: &str) -> StateResult<Option<StateEntry>>;

    /// Insert or replace an entry; `None` means no expiry
    async fn set(&self, entry: StateEntry, ttl: Option<Duration>) -> StateResult<()>;

    /// Remove an entry, reporting whether it existed
    async fn delete(&self, correlation_id: &str) -> StateResult<bool>;

    /// Drop every expired entry, returning how many were removed
    async fn purge_expired(&self) -> StateResult<usize>;
}

/// Fold a window's summary into the stored state and refresh its TTL
///
/// Returns the updated entry. Two engines stitching the same correlation at
/// the same moment can lose one window's increment; state is advisory.
pub async fn stitch(
    state: &dyn StateManager,
    summary: &CorrelationSummary,
    ttl: Option<Duration>,
) -> StateResult<StateEntry> {
    let entry = match state.get(&summary.correlation_id).await? {
        Some(mut entry) => {
            entry.observe(summary);
            entry
        }
        None => StateEntry::from_summary(summary),
    };
    state.set(entry.clone(), ttl).await?;
    Ok(entry)
}

/// Build the configured backend
pub fn from_settings(settings: &StateSettings) -> StateResult<Arc<dyn StateManager>> {
    match (settings.backend.to_lowercase().as_str(), &settings.path) {
        ("sqlite", Some(path)) => Ok(Arc::new(SqliteStateManager::open(path)?)),
        ("sqlite", None) => Err(StateError::Unavailable(
            "sqlite state backend requires a path".to_string(),
        )),
        _ => Ok(Arc::new(MemoryStateManager::new())),
    }
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
