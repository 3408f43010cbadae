//! Operator-visible counters for telcorr
//!
//! Every silent degradation (queue drops, breaker transitions, dead letters,
//! state failures) bumps a counter here so it stays observable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::events::TelemetryClass;

/// Engine-wide metrics
#[derive(Debug)]
pub struct EngineMetrics {
    start_time: Instant,
    pub ingest: IngestMetrics,
    pub correlation: CorrelationMetrics,
    pub export: ExportMetrics,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ingest: IngestMetrics::default(),
            correlation: CorrelationMetrics::default(),
            export: ExportMetrics::default(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_accepted(&self, class: TelemetryClass) {
        match class {
            TelemetryClass::Logs => self.ingest.log_batches_accepted.fetch_add(1, Ordering::Relaxed),
            TelemetryClass::Spans => self.ingest.span_batches_accepted.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_dropped(&self, class: TelemetryClass) {
        match class {
            TelemetryClass::Logs => self.ingest.log_batches_dropped.fetch_add(1, Ordering::Relaxed),
            TelemetryClass::Spans => self.ingest.span_batches_dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn dropped(&self, class: TelemetryClass) -> u64 {
        match class {
            TelemetryClass::Logs => self.ingest.log_batches_dropped.load(Ordering::Relaxed),
            TelemetryClass::Spans => self.ingest.span_batches_dropped.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP telcorr_uptime_seconds Time since engine started\n");
        output.push_str("# TYPE telcorr_uptime_seconds gauge\n");
        output.push_str(&format!("telcorr_uptime_seconds {}\n\n", self.uptime_seconds()));

        output.push_str("# HELP telcorr_ingest_batches_total Batches accepted into a queue\n");
        output.push_str("# TYPE telcorr_ingest_batches_total counter\n");
        output.push_str(&format!(
            "telcorr_ingest_batches_total{{class=\"logs\"}} {}\n",
            self.ingest.log_batches_accepted.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "telcorr_ingest_batches_total{{class=\"spans\"}} {}\n\n",
            self.ingest.span_batches_accepted.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP telcorr_ingest_dropped_total Batches dropped at ingestion\n");
        output.push_str("# TYPE telcorr_ingest_dropped_total counter\n");
        output.push_str(&format!(
            "telcorr_ingest_dropped_total{{class=\"logs\"}} {}\n",
            self.ingest.log_batches_dropped.load(Ordering::Relaxed)
        ));
        output.push_str(&format!(
            "telcorr_ingest_dropped_total{{class=\"spans\"}} {}\n\n",
            self.ingest.span_batches_dropped.load(Ordering::Relaxed)
        ));

        let counters: [(&str, &str, &AtomicU64); 13] = [
            (
                "telcorr_events_normalized_total",
                "Events produced by the normalizer",
                &self.ingest.events_normalized,
            ),
            (
                "telcorr_events_unkeyed_total",
                "Events with no extractable correlation key",
                &self.ingest.events_unkeyed,
            ),
            (
                "telcorr_windows_closed_total",
                "Correlation windows closed",
                &self.correlation.windows_closed,
            ),
            (
                "telcorr_invariant_violations_total",
                "Rejected operations on a window that is no longer open",
                &self.correlation.invariant_violations,
            ),
            (
                "telcorr_summaries_total",
                "Correlation summaries produced",
                &self.correlation.summaries_produced,
            ),
            (
                "telcorr_parents_inferred_total",
                "Summaries that received an inferred parent",
                &self.correlation.parents_inferred,
            ),
            (
                "telcorr_state_errors_total",
                "Failed state manager operations",
                &self.correlation.state_errors,
            ),
            (
                "telcorr_summaries_exported_total",
                "Summaries delivered to a sink",
                &self.export.summaries_exported,
            ),
            (
                "telcorr_export_failures_total",
                "Sink calls that failed after retries",
                &self.export.export_failures,
            ),
            (
                "telcorr_export_short_circuited_total",
                "Sink calls skipped by an open breaker",
                &self.export.short_circuited,
            ),
            (
                "telcorr_breaker_transitions_total",
                "Circuit breaker state transitions",
                &self.export.breaker_transitions,
            ),
            (
                "telcorr_dead_letters_total",
                "Summaries sent to the dead letter queue",
                &self.export.dead_lettered,
            ),
            (
                "telcorr_dead_letters_replayed_total",
                "Dead letters successfully re-exported",
                &self.export.dead_letters_replayed,
            ),
        ];

        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, counter.load(Ordering::Relaxed)));
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "ingest": {
                "log_batches_accepted": self.ingest.log_batches_accepted.load(Ordering::Relaxed),
                "span_batches_accepted": self.ingest.span_batches_accepted.load(Ordering::Relaxed),
                "log_batches_dropped": self.ingest.log_batches_dropped.load(Ordering::Relaxed),
                "span_batches_dropped": self.ingest.span_batches_dropped.load(Ordering::Relaxed),
                "events_normalized": self.ingest.events_normalized.load(Ordering::Relaxed),
                "events_unkeyed": self.ingest.events_unkeyed.load(Ordering::Relaxed),
            },
            "correlation": {
                "windows_closed": self.correlation.windows_closed.load(Ordering::Relaxed),
                "invariant_violations": self.correlation.invariant_violations.load(Ordering::Relaxed),
                "summaries_produced": self.correlation.summaries_produced.load(Ordering::Relaxed),
                "parents_inferred": self.correlation.parents_inferred.load(Ordering::Relaxed),
                "state_errors": self.correlation.state_errors.load(Ordering::Relaxed),
            },
            "export": {
                "summaries_exported": self.export.summaries_exported.load(Ordering::Relaxed),
                "export_failures": self.export.export_failures.load(Ordering::Relaxed),
                "short_circuited": self.export.short_circuited.load(Ordering::Relaxed),
                "breaker_transitions": self.export.breaker_transitions.load(Ordering::Relaxed),
                "dead_lettered": self.export.dead_lettered.load(Ordering::Relaxed),
                "dead_letters_replayed": self.export.dead_letters_replayed.load(Ordering::Relaxed),
            },
        })
    }
}

/// Ingestion and normalization counters
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub log_batches_accepted: AtomicU64,
    pub span_batches_accepted: AtomicU64,
    pub log_batches_dropped: AtomicU64,
    pub span_batches_dropped: AtomicU64,
    pub events_normalized: AtomicU64,
    pub events_unkeyed: AtomicU64,
}

/// Window, scoring and state counters
#[derive(Debug, Default)]
pub struct CorrelationMetrics {
    pub windows_closed: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub summaries_produced: AtomicU64,
    pub parents_inferred: AtomicU64,
    pub state_errors: AtomicU64,
}

/// Export path counters
#[derive(Debug, Default)]
pub struct ExportMetrics {
    pub summaries_exported: AtomicU64,
    pub export_failures: AtomicU64,
    pub short_circuited: AtomicU64,
    pub breaker_transitions: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dead_letters_replayed: AtomicU64,
}

/// Shared metrics instance
pub type SharedMetrics = Arc<EngineMetrics>;

/// Create a new shared metrics collector
pub fn create_metrics() -> SharedMetrics {
    Arc::new(EngineMetrics::new())
}
