//! Processing-time correlation windows
//!
//! A window is owned by exactly one task (the engine loop) and moves through
//! `Open -> Closing -> Summarized -> Discarded`. It is summarized at most once;
//! any further `add_event` or close is an invariant violation.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use telcorr_core::config::ScoringWeights;
use telcorr_core::{CorrelationKey, CorrelationSummary, EventKind, KeyKind, NormalizedEvent};
use thiserror::Error;
use tracing::{debug, error};

/// Lifecycle phase of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    Open,
    Closing,
    Summarized,
    Discarded,
}

impl fmt::Display for WindowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WindowPhase::Open => "open",
            WindowPhase::Closing => "closing",
            WindowPhase::Summarized => "summarized",
            WindowPhase::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Invariant violations on a window
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Cannot add event {event_id} to window {window_id}: window is {phase}")]
    AddAfterClose {
        window_id: String,
        event_id: String,
        phase: WindowPhase,
    },

    #[error("Window {window_id} cannot be closed: window is {phase}")]
    AlreadyClosed {
        window_id: String,
        phase: WindowPhase,
    },
}

pub type WindowResult<T> = Result<T, WindowError>;

/// Events accumulated under their correlation keys for one interval
#[derive(Debug)]
pub struct CorrelationWindow {
    id: String,
    start: DateTime<Utc>,
    duration: Duration,
    weights: ScoringWeights,
    phase: WindowPhase,
    flush_requested: bool,
    event_count: usize,
    closed_at: Option<DateTime<Utc>>,
    events_by_key: BTreeMap<CorrelationKey, Vec<Arc<NormalizedEvent>>>,
}

impl CorrelationWindow {
    pub fn new(start: DateTime<Utc>, duration: Duration, weights: ScoringWeights) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            start,
            duration,
            weights,
            phase: WindowPhase::Open,
            flush_requested: false,
            event_count: 0,
            closed_at: None,
            events_by_key: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn phase(&self) -> WindowPhase {
        self.phase
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Distinct events added (an event under several keys counts once)
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn key_count(&self) -> usize {
        self.events_by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Append an event to the bucket of every key it carries
    pub fn add_event(&mut self, event: Arc<NormalizedEvent>) -> WindowResult<()> {
        if self.phase != WindowPhase::Open {
            let err = WindowError::AddAfterClose {
                window_id: self.id.clone(),
                event_id: event.id.clone(),
                phase: self.phase,
            };
            error!("{}", err);
            return Err(err);
        }

        for key in &event.keys {
            self.events_by_key
                .entry(key.clone())
                .or_default()
                .push(event.clone());
        }
        self.event_count += 1;
        Ok(())
    }

    /// Close on the next check regardless of elapsed time
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    pub fn should_close(&self, now: DateTime<Utc>) -> bool {
        self.phase == WindowPhase::Open
            && (self.flush_requested || now - self.start >= self.duration)
    }

    /// Build one summary per key and make the window terminal
    pub fn close_and_summarize(&mut self, now: DateTime<Utc>) -> WindowResult<Vec<CorrelationSummary>> {
        if self.phase != WindowPhase::Open {
            let err = WindowError::AlreadyClosed {
                window_id: self.id.clone(),
                phase: self.phase,
            };
            error!("{}", err);
            return Err(err);
        }

        self.phase = WindowPhase::Closing;
        let closed_at = now.max(self.start);
        self.closed_at = Some(closed_at);

        let summaries: Vec<CorrelationSummary> = self
            .events_by_key
            .iter()
            .filter_map(|(key, events)| self.summarize(key, events, closed_at))
            .collect();

        self.phase = WindowPhase::Summarized;
        debug!(
            window_id = %self.id,
            events = self.event_count,
            summaries = summaries.len(),
            "Window summarized"
        );
        Ok(summaries)
    }

    /// Release the events; the window stays terminal
    pub fn discard(&mut self) {
        self.events_by_key.clear();
        self.phase = WindowPhase::Discarded;
    }

    /// Key buckets, available until the window is discarded
    pub fn buckets(&self) -> impl Iterator<Item = (&CorrelationKey, &[Arc<NormalizedEvent>])> {
        self.events_by_key.iter().map(|(k, v)| (k, v.as_slice()))
    }

    fn summarize(
        &self,
        key: &CorrelationKey,
        events: &[Arc<NormalizedEvent>],
        closed_at: DateTime<Utc>,
    ) -> Option<CorrelationSummary> {
        let first = events.first()?;

        let mut log_count = 0;
        let mut span_count = 0;
        let mut severity_counts = BTreeMap::new();
        let mut services = BTreeSet::new();
        let mut start_time = first.received_at;
        let mut end_time = first.received_at;

        for event in events {
            match event.kind() {
                EventKind::Log => log_count += 1,
                EventKind::Span => span_count += 1,
            }
            if let Some(severity) = event.severity() {
                *severity_counts.entry(severity).or_insert(0) += 1;
            }
            services.insert(event.service.clone());
            start_time = start_time.min(event.received_at);
            end_time = end_time.max(event.received_at);
        }

        // Summaries stay inside [window start, close time]
        let start_time = start_time.clamp(self.start, closed_at);
        let end_time = end_time.clamp(start_time, closed_at);

        Some(CorrelationSummary {
            summary_id: ulid::Ulid::new().to_string(),
            correlation_id: key.correlation_id(),
            primary_key: key.clone(),
            window_start: self.start,
            log_count,
            span_count,
            severity_counts,
            services,
            start_time,
            end_time,
            confidence_score: key_confidence(key.kind, &self.weights),
            parent: None,
            windows_seen: 1,
        })
    }
}

/// Confidence of grouping by a key of this kind
///
/// Explicit ids are certain, business ids are weighted relative to a trace id,
/// and the unkeyed bucket carries no correlation at all.
pub fn key_confidence(kind: KeyKind, weights: &ScoringWeights) -> f64 {
    match kind {
        KeyKind::TraceId | KeyKind::SpanId => 1.0,
        KeyKind::Unkeyed => 0.0,
        business if weights.trace_id > 0.0 => {
            (weights.for_kind(business) / weights.trace_id).clamp(0.0, 1.0)
        }
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{Normalizer, RawRecord};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use telcorr_core::{RawLogRecord, RawSpan, ResourceContext, Severity};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn window() -> CorrelationWindow {
        CorrelationWindow::new(t0(), Duration::seconds(60), ScoringWeights::default())
    }

    fn log(trace: &str, severity: &str, at_secs: i64) -> Arc<NormalizedEvent> {
        let record = RawLogRecord {
            trace_id: Some(trace.to_string()),
            severity_text: Some(severity.to_string()),
            ..Default::default()
        };
        let resource = ResourceContext::new("checkout", "host-a", "prod");
        Arc::new(Normalizer::default().normalize(
            RawRecord::Log(&record),
            &resource,
            "b#0",
            t0() + Duration::seconds(at_secs),
        ))
    }

    fn span(trace: &str, service: &str, at_secs: i64) -> Arc<NormalizedEvent> {
        let raw = RawSpan {
            trace_id: Some(trace.to_string()),
            span_id: Some(format!("{}-{}", service, at_secs)),
            name: "op".to_string(),
            ..Default::default()
        };
        let resource = ResourceContext::new(service, "host-b", "prod");
        Arc::new(Normalizer::default().normalize(
            RawRecord::Span(&raw),
            &resource,
            "b#1",
            t0() + Duration::seconds(at_secs),
        ))
    }

    #[test]
    fn test_trace_42_scenario() {
        let mut w = window();
        for i in 0..5 {
            w.add_event(log("trace-42", "info", i)).unwrap();
        }
        for i in 0..3 {
            w.add_event(span("trace-42", "checkout", 10 + i)).unwrap();
        }

        let summaries = w.close_and_summarize(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.log_count, 5);
        assert_eq!(s.span_count, 3);
        assert_eq!(s.confidence_score, 1.0);
        assert_eq!(s.primary_key, CorrelationKey::trace("trace-42"));
        assert_eq!(s.correlation_id, CorrelationKey::trace("trace-42").correlation_id());
    }

    #[test]
    fn test_counts_add_up() {
        let mut w = window();
        let severities = ["info", "warn", "error", "error", "debug", "fatal"];
        for (i, sev) in severities.iter().enumerate() {
            w.add_event(log("t-1", sev, i as i64)).unwrap();
        }
        for i in 0..4 {
            w.add_event(span("t-1", "payments", i)).unwrap();
        }

        let summaries = w.close_and_summarize(t0() + Duration::seconds(61)).unwrap();
        let s = &summaries[0];
        assert_eq!(s.event_count(), 10);
        assert_eq!(s.severity_counts.values().sum::<u64>(), s.log_count);
        assert_eq!(s.severity_counts[&Severity::Error], 2);
        assert_eq!(s.error_count(), 3);
        assert_eq!(s.services.len(), 2);
        assert_eq!(s.start_time, t0());
        assert_eq!(s.end_time, t0() + Duration::seconds(5));
    }

    #[test]
    fn test_event_under_several_keys() {
        let record = RawLogRecord {
            trace_id: Some("t-9".to_string()),
            attributes: HashMap::from([("circuit_id".to_string(), json!("C-1"))]),
            ..Default::default()
        };
        let normalizer =
            Normalizer::from_settings(&telcorr_core::config::CorrelationSettings::default());
        let event = normalizer.normalize(
            RawRecord::Log(&record),
            &ResourceContext::default(),
            "b#0",
            t0(),
        );

        let mut w = window();
        w.add_event(Arc::new(event)).unwrap();
        assert_eq!(w.event_count(), 1);
        assert_eq!(w.key_count(), 2);

        let summaries = w.close_and_summarize(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(summaries.len(), 2);
        let circuit = summaries
            .iter()
            .find(|s| s.primary_key.kind == KeyKind::CircuitId)
            .unwrap();
        assert_eq!(circuit.confidence_score, 0.5);
    }

    #[test]
    fn test_should_close() {
        let mut w = window();
        assert!(!w.should_close(t0() + Duration::seconds(59)));
        assert!(w.should_close(t0() + Duration::seconds(60)));

        let mut flushed = window();
        flushed.request_flush();
        assert!(flushed.should_close(t0()));

        w.close_and_summarize(t0() + Duration::seconds(60)).unwrap();
        assert!(!w.should_close(t0() + Duration::seconds(120)));
    }

    #[test]
    fn test_closes_exactly_once() {
        let mut w = window();
        w.add_event(log("t-1", "info", 1)).unwrap();
        w.close_and_summarize(t0() + Duration::seconds(60)).unwrap();
        assert_eq!(w.phase(), WindowPhase::Summarized);

        let err = w.close_and_summarize(t0() + Duration::seconds(61)).unwrap_err();
        assert!(matches!(err, WindowError::AlreadyClosed { .. }));

        let late = log("t-1", "info", 62);
        assert!(matches!(
            w.add_event(late),
            Err(WindowError::AddAfterClose { .. })
        ));

        w.discard();
        assert_eq!(w.phase(), WindowPhase::Discarded);
        assert_eq!(w.buckets().count(), 0);
    }

    #[test]
    fn test_unkeyed_confidence() {
        let weights = ScoringWeights::default();
        assert_eq!(key_confidence(KeyKind::Unkeyed, &weights), 0.0);
        assert_eq!(key_confidence(KeyKind::SpanId, &weights), 1.0);
        assert_eq!(key_confidence(KeyKind::ResourceId, &weights), 0.6);
    }
}
