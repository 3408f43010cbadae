//! Shared state backend on SQLite
//!
//! Several engine processes on one host can point at the same database file.
//! WAL journaling plus a busy timeout lets them read and write concurrently;
//! every write is a single `INSERT OR REPLACE` so there is no read-modify-write
//! window inside the database.

use crate::entry::StateEntry;
use crate::error::{StateError, StateResult};
use crate::StateManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS correlation_state (
    correlation_id TEXT PRIMARY KEY,
    entry_json TEXT NOT NULL,
    expires_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_correlation_state_expires
    ON correlation_state(expires_at);";

/// State stored in a SQLite database file
#[derive(Clone)]
pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateManager {
    /// Open (or create) the state database at `path`
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), journal_mode = %mode, "State database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking database operation off the async runtime
    async fn with_conn<T, F>(&self, op: F) -> StateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StateResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn)
        })
        .await
        .map_err(|e| StateError::Unavailable(e.to_string()))?
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl StateManager for SqliteStateManager {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, correlation_id: &str) -> StateResult<Option<StateEntry>> {
        let id = correlation_id.to_string();
        self.with_conn(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT entry_json FROM correlation_state
                     WHERE correlation_id = ?1
                       AND (expires_at IS NULL OR expires_at > ?2)",
                    params![id, now_ms()],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|json| serde_json::from_str(&json).map_err(StateError::from))
                .transpose()
        })
        .await
    }

    async fn set(&self, entry: StateEntry, ttl: Option<Duration>) -> StateResult<()> {
        let json = serde_json::to_string(&entry)?;
        self.with_conn(move |conn| {
            let now = now_ms();
            let expires_at =
                ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));
            conn.execute(
                "INSERT OR REPLACE INTO correlation_state
                     (correlation_id, entry_json, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entry.correlation_id, json, expires_at, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, correlation_id: &str) -> StateResult<bool> {
        let id = correlation_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM correlation_state WHERE correlation_id = ?1",
                params![id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        self.with_conn(|conn| {
            let purged = conn.execute(
                "DELETE FROM correlation_state
                 WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ms()],
            )?;
            if purged > 0 {
                debug!(purged, "Purged expired state rows");
            }
            Ok(purged)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::summary;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let state = SqliteStateManager::in_memory().unwrap();
        let entry = StateEntry::from_summary(&summary("trace-1", 4));
        let id = entry.correlation_id.clone();

        state
            .set(entry.clone(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(state.get(&id).await.unwrap(), Some(entry));
        assert_eq!(state.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible_and_purged() {
        let state = SqliteStateManager::in_memory().unwrap();
        let expired = StateEntry::from_summary(&summary("trace-1", 1));
        let live = StateEntry::from_summary(&summary("trace-2", 1));
        let expired_id = expired.correlation_id.clone();

        state.set(expired, Some(Duration::ZERO)).await.unwrap();
        state.set(live, None).await.unwrap();

        assert_eq!(state.get(&expired_id).await.unwrap(), None);
        assert_eq!(state.purge_expired().await.unwrap(), 1);
        assert_eq!(state.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shared_file_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("telcorr.db");

        let a = SqliteStateManager::open(&path).unwrap();
        let b = SqliteStateManager::open(&path).unwrap();

        let mut entry = StateEntry::from_summary(&summary("trace-1", 2));
        a.set(entry.clone(), None).await.unwrap();

        let seen_by_b = b.get(&entry.correlation_id).await.unwrap().unwrap();
        assert_eq!(seen_by_b.windows_seen, 1);

        entry.observe(&summary("trace-1", 5));
        b.set(entry.clone(), None).await.unwrap();

        let seen_by_a = a.get(&entry.correlation_id).await.unwrap().unwrap();
        assert_eq!(seen_by_a.windows_seen, 2);
        assert_eq!(seen_by_a.total_events, 7);
        assert!(a.delete(&entry.correlation_id).await.unwrap());
    }
}
