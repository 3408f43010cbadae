//! Dead letter queue for summaries no sink would accept
//!
//! Items land here when a sink's breaker is open or its retries ran out.
//! Nothing is retried automatically; operators drain the queue explicitly
//! (see `ExporterManager::replay_dead_letters`).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telcorr_core::config::DlqSettings;
use telcorr_core::CorrelationSummary;
use thiserror::Error;
use tracing::{debug, info, warn};

/// DLQ error type
#[derive(Error, Debug)]
pub enum DlqError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dead letter queue unavailable: {0}")]
    Unavailable(String),
}

pub type DlqResult<T> = Result<T, DlqError>;

/// A summary that could not be delivered to one sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Unique per dead letter (ULID)
    pub id: String,

    /// Sink that failed
    pub sink: String,

    pub reason: String,

    pub summary: CorrelationSummary,

    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        summary: CorrelationSummary,
        sink: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            sink: sink.into(),
            reason: reason.into(),
            summary,
            failed_at: Utc::now(),
        }
    }
}

/// Storage for dead letters, oldest first
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Append letters; returns how many older letters were evicted to make room
    async fn enqueue(&self, letters: Vec<DeadLetter>) -> DlqResult<usize>;

    /// Remove and return up to `limit` letters, oldest first
    async fn drain(&self, limit: usize) -> DlqResult<Vec<DeadLetter>>;

    /// Return up to `limit` letters without removing them
    async fn peek(&self, limit: usize) -> DlqResult<Vec<DeadLetter>>;

    async fn depth(&self) -> DlqResult<usize>;

    /// Letters evicted since startup because the queue was full
    fn evicted(&self) -> u64;
}

/// Bounded in-process queue; the oldest letter makes room when full
pub struct MemoryDeadLetterQueue {
    items: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl MemoryDeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(&self, letters: Vec<DeadLetter>) -> DlqResult<usize> {
        let mut items = self.items.lock();
        let mut evicted = 0;
        for letter in letters {
            if items.len() >= self.capacity {
                items.pop_front();
                evicted += 1;
            }
            items.push_back(letter);
        }
        if evicted > 0 {
            warn!(
                "Dead letter queue full ({} letters), evicted {} oldest",
                self.capacity, evicted
            );
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Ok(evicted)
    }

    async fn drain(&self, limit: usize) -> DlqResult<Vec<DeadLetter>> {
        let mut items = self.items.lock();
        let n = limit.min(items.len());
        Ok(items.drain(..n).collect())
    }

    async fn peek(&self, limit: usize) -> DlqResult<Vec<DeadLetter>> {
        Ok(self.items.lock().iter().take(limit).cloned().collect())
    }

    async fn depth(&self) -> DlqResult<usize> {
        Ok(self.items.lock().len())
    }

    fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS dead_letters (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    letter_id TEXT NOT NULL,
    sink TEXT NOT NULL,
    reason TEXT NOT NULL,
    summary_json TEXT NOT NULL,
    failed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_sink ON dead_letters(sink);";

/// Persistent FIFO queue in a SQLite file
pub struct SqliteDeadLetterQueue {
    conn: Arc<Mutex<Connection>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl SqliteDeadLetterQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> DlqResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        info!("Dead letter queue initialized at {}", path.display());

        Ok(Self::from_connection(conn, capacity))
    }

    /// Create an in-memory queue (for testing)
    pub fn in_memory(capacity: usize) -> DlqResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn, capacity))
    }

    fn from_connection(conn: Connection, capacity: usize) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn with_conn<T, F>(&self, op: F) -> DlqResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> DlqResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .map_err(|e| DlqError::Unavailable(e.to_string()))?
    }

    /// Read the oldest `limit` rows; corrupt rows are returned for deletion only
    fn select_oldest(conn: &Connection, limit: usize) -> DlqResult<(Vec<i64>, Vec<DeadLetter>)> {
        let mut stmt = conn.prepare(
            "SELECT seq, letter_id, sink, reason, summary_json, failed_at
             FROM dead_letters ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut seqs = Vec::new();
        let mut letters = Vec::new();
        for row in rows {
            let (seq, id, sink, reason, json, failed_at) = row?;
            seqs.push(seq);
            match serde_json::from_str::<CorrelationSummary>(&json) {
                Ok(summary) => letters.push(DeadLetter {
                    id,
                    sink,
                    reason,
                    summary,
                    failed_at: Utc
                        .timestamp_millis_opt(failed_at)
                        .single()
                        .unwrap_or_else(Utc::now),
                }),
                Err(e) => warn!("Skipping corrupt dead letter {}: {}", id, e),
            }
        }
        Ok((seqs, letters))
    }
}

#[async_trait]
impl DeadLetterQueue for SqliteDeadLetterQueue {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn enqueue(&self, letters: Vec<DeadLetter>) -> DlqResult<usize> {
        if letters.is_empty() {
            return Ok(0);
        }
        let rows = letters
            .into_iter()
            .map(|l| {
                let json = serde_json::to_string(&l.summary)?;
                Ok((l.id, l.sink, l.reason, json, l.failed_at.timestamp_millis()))
            })
            .collect::<DlqResult<Vec<_>>>()?;
        let capacity = self.capacity;
        let evicted_total = self.evicted.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = rows.len();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dead_letters (letter_id, sink, reason, summary_json, failed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (id, sink, reason, json, failed_at) in &rows {
                    stmt.execute(params![id, sink, reason, json, failed_at])?;
                }
            }

            let count: i64 = tx.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
            let overflow = (count as usize).saturating_sub(capacity);
            if overflow > 0 {
                tx.execute(
                    "DELETE FROM dead_letters WHERE seq IN
                     (SELECT seq FROM dead_letters ORDER BY seq ASC LIMIT ?1)",
                    params![overflow as i64],
                )?;
                warn!(
                    "Dead letter queue full ({} letters), evicted {} oldest",
                    capacity, overflow
                );
                evicted_total.fetch_add(overflow as u64, Ordering::Relaxed);
            }
            tx.commit()?;

            debug!("Enqueued {} dead letters", inserted);
            Ok(overflow)
        })
        .await
    }

    async fn drain(&self, limit: usize) -> DlqResult<Vec<DeadLetter>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (seqs, letters) = Self::select_oldest(&tx, limit)?;
            {
                let mut stmt = tx.prepare("DELETE FROM dead_letters WHERE seq = ?1")?;
                for seq in &seqs {
                    stmt.execute(params![seq])?;
                }
            }
            tx.commit()?;

            debug!("Drained {} dead letters", letters.len());
            Ok(letters)
        })
        .await
    }

    async fn peek(&self, limit: usize) -> DlqResult<Vec<DeadLetter>> {
        self.with_conn(move |conn| Ok(Self::select_oldest(conn, limit)?.1))
            .await
    }

    async fn depth(&self) -> DlqResult<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Build the configured backend
pub fn from_settings(settings: &DlqSettings) -> DlqResult<Arc<dyn DeadLetterQueue>> {
    match (settings.backend.to_lowercase().as_str(), &settings.path) {
        ("sqlite", Some(path)) => Ok(Arc::new(SqliteDeadLetterQueue::open(
            path,
            settings.capacity,
        )?)),
        ("sqlite", None) => Err(DlqError::Unavailable(
            "sqlite dead letter queue requires a path".to_string(),
        )),
        _ => Ok(Arc::new(MemoryDeadLetterQueue::new(settings.capacity))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use telcorr_core::CorrelationKey;

    pub(crate) fn summary(trace: &str) -> CorrelationSummary {
        let key = CorrelationKey::trace(trace);
        let now = Utc::now();
        CorrelationSummary {
            summary_id: ulid::Ulid::new().to_string(),
            correlation_id: key.correlation_id(),
            primary_key: key,
            window_start: now,
            log_count: 1,
            span_count: 0,
            severity_counts: BTreeMap::new(),
            services: BTreeSet::new(),
            start_time: now,
            end_time: now,
            confidence_score: 1.0,
            parent: None,
            windows_seen: 1,
        }
    }

    fn letter(trace: &str) -> DeadLetter {
        DeadLetter::new(summary(trace), "webhook", "circuit open")
    }

    fn traces(letters: &[DeadLetter]) -> Vec<String> {
        letters
            .iter()
            .map(|l| l.summary.primary_key.value.clone())
            .collect()
    }

    async fn exercise_fifo(queue: &dyn DeadLetterQueue) {
        queue
            .enqueue(vec![letter("1"), letter("2"), letter("3")])
            .await
            .unwrap();
        assert_eq!(queue.depth().await.unwrap(), 3);

        let peeked = queue.peek(1).await.unwrap();
        assert_eq!(traces(&peeked), vec!["1"]);
        assert_eq!(queue.depth().await.unwrap(), 3);

        let drained = queue.drain(2).await.unwrap();
        assert_eq!(traces(&drained), vec!["1", "2"]);
        assert_eq!(drained[0].sink, "webhook");
        assert_eq!(drained[0].reason, "circuit open");
        assert_eq!(queue.depth().await.unwrap(), 1);

        let rest = queue.drain(10).await.unwrap();
        assert_eq!(traces(&rest), vec!["3"]);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_fifo() {
        exercise_fifo(&MemoryDeadLetterQueue::new(100)).await;
    }

    #[tokio::test]
    async fn test_sqlite_fifo() {
        exercise_fifo(&SqliteDeadLetterQueue::in_memory(100).unwrap()).await;
    }

    #[tokio::test]
    async fn test_memory_evicts_oldest() {
        let queue = MemoryDeadLetterQueue::new(2);
        let evicted = queue
            .enqueue(vec![letter("1"), letter("2"), letter("3")])
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(queue.evicted(), 1);
        assert_eq!(traces(&queue.peek(10).await.unwrap()), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_sqlite_evicts_oldest() {
        let queue = SqliteDeadLetterQueue::in_memory(2).unwrap();
        queue.enqueue(vec![letter("1"), letter("2")]).await.unwrap();
        let evicted = queue.enqueue(vec![letter("3")]).await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(queue.evicted(), 1);
        assert_eq!(traces(&queue.peek(10).await.unwrap()), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.db");

        {
            let queue = SqliteDeadLetterQueue::open(&path, 100).unwrap();
            queue.enqueue(vec![letter("kept")]).await.unwrap();
        }

        let queue = SqliteDeadLetterQueue::open(&path, 100).unwrap();
        let letters = queue.drain(10).await.unwrap();
        assert_eq!(traces(&letters), vec!["kept"]);
    }

    #[test]
    fn test_from_settings() {
        let queue = from_settings(&DlqSettings::default()).unwrap();
        assert_eq!(queue.name(), "memory");

        let settings = DlqSettings {
            backend: "sqlite".to_string(),
            path: None,
            ..Default::default()
        };
        assert!(from_settings(&settings).is_err());
    }
}
