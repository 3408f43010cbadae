//! Normalization of raw records into [`NormalizedEvent`]s
//!
//! Key extraction walks a fixed priority list:
//! 1. the explicit trace id, or the span id when no trace id is present
//! 2. configured business-identifier rules, in configured order
//! 3. nothing, in which case the event gets the synthetic unkeyed key
//!
//! Malformed or identifier-free records are never rejected.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use telcorr_core::config::{CorrelationSettings, KeyRule};
use telcorr_core::{
    CorrelationKey, EventDetail, LogBatch, NormalizedEvent, RawBatch, RawLogRecord,
    RawSpan, ResourceContext, Severity, SpanBatch, SpanMeta,
};

/// Record-level attribute that overrides the batch service
pub const SERVICE_NAME_ATTRIBUTE: &str = "service.name";

/// Span attribute naming the downstream service when `peer_service` is unset
pub const PEER_SERVICE_ATTRIBUTE: &str = "peer.service";

/// A single raw record, borrowed from its batch
#[derive(Debug, Clone, Copy)]
pub enum RawRecord<'a> {
    Log(&'a RawLogRecord),
    Span(&'a RawSpan),
}

impl RawRecord<'_> {
    fn attributes(&self) -> &HashMap<String, Value> {
        match self {
            RawRecord::Log(r) => &r.attributes,
            RawRecord::Span(s) => &s.attributes,
        }
    }

    fn trace_id(&self) -> Option<&str> {
        match self {
            RawRecord::Log(r) => non_blank(r.trace_id.as_deref()),
            RawRecord::Span(s) => non_blank(s.trace_id.as_deref()),
        }
    }

    fn span_id(&self) -> Option<&str> {
        match self {
            RawRecord::Log(r) => non_blank(r.span_id.as_deref()),
            RawRecord::Span(s) => non_blank(s.span_id.as_deref()),
        }
    }
}

/// Turns raw records into normalized events
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    rules: Vec<KeyRule>,
}

impl Normalizer {
    pub fn new(rules: Vec<KeyRule>) -> Self {
        Self { rules }
    }

    pub fn from_settings(settings: &CorrelationSettings) -> Self {
        Self::new(settings.key_rules.clone())
    }

    pub fn rules(&self) -> &[KeyRule] {
        &self.rules
    }

    /// Normalize one record under its batch's resource context
    pub fn normalize(
        &self,
        record: RawRecord<'_>,
        resource: &ResourceContext,
        raw_ref: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> NormalizedEvent {
        let keys = self.extract_keys(record);
        let service = string_attr(record.attributes(), SERVICE_NAME_ATTRIBUTE)
            .unwrap_or_else(|| resource.service.clone());

        let (timestamp, detail) = match record {
            RawRecord::Log(log) => (
                log.timestamp.unwrap_or(received_at),
                EventDetail::Log {
                    severity: log_severity(log),
                },
            ),
            RawRecord::Span(span) => (
                span.start_time.unwrap_or(received_at),
                EventDetail::Span(span_meta(span)),
            ),
        };

        NormalizedEvent {
            id: ulid::Ulid::new().to_string(),
            service,
            host: resource.host.clone(),
            environment: resource.environment.clone(),
            timestamp,
            received_at,
            detail,
            keys,
            raw_ref: raw_ref.into(),
        }
    }

    /// Normalize every record of a batch
    pub fn normalize_batch(
        &self,
        batch: &RawBatch,
        received_at: DateTime<Utc>,
    ) -> Vec<NormalizedEvent> {
        match batch {
            RawBatch::Logs(batch) => self.normalize_logs(batch, received_at),
            RawBatch::Spans(batch) => self.normalize_spans(batch, received_at),
        }
    }

    pub fn normalize_logs(&self, batch: &LogBatch, received_at: DateTime<Utc>) -> Vec<NormalizedEvent> {
        batch
            .records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                self.normalize(
                    RawRecord::Log(record),
                    &batch.resource,
                    raw_ref(&batch.batch_id, i),
                    received_at,
                )
            })
            .collect()
    }

    pub fn normalize_spans(
        &self,
        batch: &SpanBatch,
        received_at: DateTime<Utc>,
    ) -> Vec<NormalizedEvent> {
        batch
            .spans
            .iter()
            .enumerate()
            .map(|(i, span)| {
                self.normalize(
                    RawRecord::Span(span),
                    &batch.resource,
                    raw_ref(&batch.batch_id, i),
                    received_at,
                )
            })
            .collect()
    }

    /// Correlation keys of a record, highest priority first
    pub fn extract_keys(&self, record: RawRecord<'_>) -> Vec<CorrelationKey> {
        let mut keys = Vec::new();

        if let Some(trace_id) = record.trace_id() {
            keys.push(CorrelationKey::trace(trace_id));
        } else if let Some(span_id) = record.span_id() {
            keys.push(CorrelationKey::span(span_id));
        }

        let attributes = record.attributes();
        for rule in &self.rules {
            if let Some(value) = string_attr(attributes, &rule.attribute) {
                let key = CorrelationKey::new(rule.kind, value);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        if keys.is_empty() {
            keys.push(CorrelationKey::unkeyed());
        }
        keys
    }
}

fn raw_ref(batch_id: &str, index: usize) -> String {
    format!("{}#{}", batch_id, index)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// String or numeric attribute, trimmed; blank counts as absent
fn string_attr(attributes: &HashMap<String, Value>, name: &str) -> Option<String> {
    match attributes.get(name)? {
        Value::String(s) => non_blank(Some(s.as_str())).map(str::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn log_severity(log: &RawLogRecord) -> Severity {
    let from_text = log
        .severity_text
        .as_deref()
        .map(Severity::from_text)
        .filter(|s| *s != Severity::Unspecified);

    from_text
        .or_else(|| log.severity_number.map(Severity::from_number))
        .unwrap_or(Severity::Unspecified)
}

fn span_meta(span: &RawSpan) -> SpanMeta {
    let duration_ms = match (span.start_time, span.end_time) {
        (Some(start), Some(end)) if end >= start => {
            u64::try_from((end - start).num_milliseconds()).ok()
        }
        _ => None,
    };

    let peer_service = non_blank(span.peer_service.as_deref())
        .map(str::to_string)
        .or_else(|| string_attr(&span.attributes, PEER_SERVICE_ATTRIBUTE));

    SpanMeta {
        span_id: non_blank(span.span_id.as_deref()).map(str::to_string),
        parent_span_id: non_blank(span.parent_span_id.as_deref()).map(str::to_string),
        name: span.name.clone(),
        duration_ms,
        peer_service,
        is_error: span
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("error")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use telcorr_core::{EventKind, KeyKind};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::from_settings(&CorrelationSettings::default())
    }

    fn resource() -> ResourceContext {
        ResourceContext::new("checkout", "host-a", "prod")
    }

    #[test]
    fn test_trace_id_takes_priority() {
        let record = RawLogRecord {
            trace_id: Some("trace-42".to_string()),
            span_id: Some("span-1".to_string()),
            attributes: HashMap::from([("circuit_id".to_string(), json!("C-7"))]),
            ..Default::default()
        };

        let keys = normalizer().extract_keys(RawRecord::Log(&record));
        assert_eq!(
            keys,
            vec![
                CorrelationKey::trace("trace-42"),
                CorrelationKey::new(KeyKind::CircuitId, "C-7"),
            ]
        );
    }

    #[test]
    fn test_span_id_used_without_trace_id() {
        let span = RawSpan {
            trace_id: Some("   ".to_string()),
            span_id: Some("span-9".to_string()),
            ..Default::default()
        };
        let keys = normalizer().extract_keys(RawRecord::Span(&span));
        assert_eq!(keys, vec![CorrelationKey::span("span-9")]);
    }

    #[test]
    fn test_business_rules_in_configured_order() {
        let normalizer = Normalizer::new(vec![
            KeyRule::new("sku", KeyKind::ProductId),
            KeyRule::new("order_ref", KeyKind::ResourceId),
        ]);
        let record = RawLogRecord {
            attributes: HashMap::from([
                ("order_ref".to_string(), json!(1234)),
                ("sku".to_string(), json!("SKU-1")),
            ]),
            ..Default::default()
        };

        let keys = normalizer.extract_keys(RawRecord::Log(&record));
        assert_eq!(keys[0], CorrelationKey::new(KeyKind::ProductId, "SKU-1"));
        assert_eq!(keys[1], CorrelationKey::new(KeyKind::ResourceId, "1234"));
    }

    #[test]
    fn test_unkeyed_record_still_normalized() {
        let record = RawLogRecord {
            body: Some("disk almost full".to_string()),
            attributes: HashMap::from([("resource_id".to_string(), json!(""))]),
            ..Default::default()
        };

        let event = normalizer().normalize(RawRecord::Log(&record), &resource(), "b#0", now());
        assert!(event.is_unkeyed());
        assert_eq!(event.keys, vec![CorrelationKey::unkeyed()]);
        assert_eq!(event.timestamp, now());
        assert_eq!(event.severity(), Some(Severity::Unspecified));
    }

    #[test]
    fn test_log_fields() {
        let record = RawLogRecord {
            severity_text: Some("bogus".to_string()),
            severity_number: Some(17),
            trace_id: Some("t".to_string()),
            attributes: HashMap::from([(SERVICE_NAME_ATTRIBUTE.to_string(), json!("billing"))]),
            ..Default::default()
        };

        let event = normalizer().normalize(RawRecord::Log(&record), &resource(), "b#3", now());
        assert_eq!(event.kind(), EventKind::Log);
        assert_eq!(event.severity(), Some(Severity::Error));
        assert_eq!(event.service, "billing");
        assert_eq!(event.host, "host-a");
        assert_eq!(event.raw_ref, "b#3");
    }

    #[test]
    fn test_span_fields() {
        let start = now();
        let span = RawSpan {
            trace_id: Some("t".to_string()),
            span_id: Some("s".to_string()),
            parent_span_id: Some("".to_string()),
            name: "charge".to_string(),
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::milliseconds(250)),
            status: Some("ERROR".to_string()),
            attributes: HashMap::from([(PEER_SERVICE_ATTRIBUTE.to_string(), json!("payments"))]),
            ..Default::default()
        };

        let event = normalizer().normalize(RawRecord::Span(&span), &resource(), "b#0", now());
        let meta = event.span().unwrap();
        assert_eq!(meta.duration_ms, Some(250));
        assert_eq!(meta.parent_span_id, None);
        assert_eq!(meta.peer_service.as_deref(), Some("payments"));
        assert!(meta.is_error);
    }

    #[test]
    fn test_normalize_batch_refs() {
        let batch = LogBatch::new(
            resource(),
            vec![RawLogRecord::default(), RawLogRecord::default()],
        );
        let events = normalizer().normalize_batch(&RawBatch::Logs(batch.clone()), now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].raw_ref, format!("{}#1", batch.batch_id));
        assert_ne!(events[0].id, events[1].id);
    }
}
