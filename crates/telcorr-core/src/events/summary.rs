//! Correlation summaries emitted when a window closes

use super::key::CorrelationKey;
use super::normalized::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Inferred parent of a correlation that no explicit key connects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub correlation_id: String,
    pub primary_key: CorrelationKey,

    /// Normalized score of the accepted link, in [0, 1]
    pub confidence: f64,
}

/// Aggregated view of one key within one closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSummary {
    /// Unique per summary (ULID)
    pub summary_id: String,

    /// Stable across windows and engine instances for the same key
    pub correlation_id: String,

    pub primary_key: CorrelationKey,

    /// Start of the window that produced this summary
    pub window_start: DateTime<Utc>,

    pub log_count: u64,
    pub span_count: u64,

    /// Histogram over the log subset
    pub severity_counts: BTreeMap<Severity, u64>,

    /// Distinct services observed
    pub services: BTreeSet<String>,

    /// Processing-time range of the summarized events
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// 1.0 for explicit-key matches
    pub confidence_score: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,

    /// Windows this correlation has appeared in, including this one
    #[serde(default = "one")]
    pub windows_seen: u32,
}

impl CorrelationSummary {
    pub fn event_count(&self) -> u64 {
        self.log_count + self.span_count
    }

    pub fn error_count(&self) -> u64 {
        self.severity_counts
            .iter()
            .filter(|(s, _)| matches!(s, Severity::Error | Severity::Fatal))
            .map(|(_, c)| *c)
            .sum()
    }
}

fn one() -> u32 {
    1
}
