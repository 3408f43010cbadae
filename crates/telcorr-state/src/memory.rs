//! In-process state backend

use crate::entry::StateEntry;
use crate::error::StateResult;
use crate::StateManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Slot {
    entry: StateEntry,
    deadline: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// State held in a process-local map
///
/// Deadlines use the tokio clock, so expiry follows paused time in tests.
/// Expired entries are hidden on read and removed by `purge_expired`.
#[derive(Default)]
pub struct MemoryStateManager {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, correlation_id: &str) -> StateResult<Option<StateEntry>> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get(correlation_id) {
            Some(slot) if slot.is_expired(now) => {
                slots.remove(correlation_id);
                Ok(None)
            }
            Some(slot) => Ok(Some(slot.entry.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, entry: StateEntry, ttl: Option<Duration>) -> StateResult<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.slots
            .lock()
            .insert(entry.correlation_id.clone(), Slot { entry, deadline });
        Ok(())
    }

    async fn delete(&self, correlation_id: &str) -> StateResult<bool> {
        Ok(self.slots.lock().remove(correlation_id).is_some())
    }

    async fn purge_expired(&self) -> StateResult<usize> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        let purged = before - slots.len();
        if purged > 0 {
            debug!(purged, "Purged expired state entries");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::summary;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_follows_tokio_clock() {
        let state = MemoryStateManager::new();
        let entry = StateEntry::from_summary(&summary("trace-1", 3));
        let id = entry.correlation_id.clone();

        state
            .set(entry.clone(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(state.get(&id).await.unwrap(), Some(entry));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(state.get(&id).await.unwrap(), None);
        assert!(state.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let state = MemoryStateManager::new();
        let short = StateEntry::from_summary(&summary("trace-1", 1));
        let forever = StateEntry::from_summary(&summary("trace-2", 1));

        state.set(short, Some(Duration::from_secs(1))).await.unwrap();
        state.set(forever, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(state.purge_expired().await.unwrap(), 1);
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let state = MemoryStateManager::new();
        let entry = StateEntry::from_summary(&summary("trace-1", 1));
        let id = entry.correlation_id.clone();

        state.set(entry, None).await.unwrap();
        assert!(state.delete(&id).await.unwrap());
        assert!(!state.delete(&id).await.unwrap());
    }
}
