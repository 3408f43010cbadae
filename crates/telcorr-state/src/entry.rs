//! Cross-window correlation state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use telcorr_core::{CorrelationKey, CorrelationSummary};

/// What the engine remembers about a correlation between windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub correlation_id: String,
    pub primary_key: CorrelationKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Windows the correlation appeared in
    pub windows_seen: u32,

    /// Events summed over every window
    pub total_events: u64,

    pub services: BTreeSet<String>,
}

impl StateEntry {
    /// Entry for a correlation seen for the first time
    pub fn from_summary(summary: &CorrelationSummary) -> Self {
        Self {
            correlation_id: summary.correlation_id.clone(),
            primary_key: summary.primary_key.clone(),
            first_seen: summary.start_time,
            last_seen: summary.end_time,
            windows_seen: 1,
            total_events: summary.event_count(),
            services: summary.services.clone(),
        }
    }

    /// Fold one more window's summary into the entry
    pub fn observe(&mut self, summary: &CorrelationSummary) {
        self.first_seen = self.first_seen.min(summary.start_time);
        self.last_seen = self.last_seen.max(summary.end_time);
        self.windows_seen = self.windows_seen.saturating_add(1);
        self.total_events = self.total_events.saturating_add(summary.event_count());
        self.services.extend(summary.services.iter().cloned());
    }
}
