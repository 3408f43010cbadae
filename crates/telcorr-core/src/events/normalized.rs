//! The single internal event shape every raw record is normalized into

use super::key::CorrelationKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Class of a normalized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log,
    Span,
}

/// Normalized log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unspecified,
}

impl Severity {
    /// Parse severity text as emitted by common logging libraries
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_lowercase().as_str() {
            "trace" | "finest" => Severity::Trace,
            "debug" | "fine" => Severity::Debug,
            "info" | "information" | "notice" => Severity::Info,
            "warn" | "warning" => Severity::Warn,
            "error" | "err" => Severity::Error,
            "fatal" | "critical" | "crit" | "emergency" | "alert" | "panic" => Severity::Fatal,
            _ => Severity::Unspecified,
        }
    }

    /// Map an OpenTelemetry severity number (1-24)
    pub fn from_number(number: i32) -> Self {
        match number {
            1..=4 => Severity::Trace,
            5..=8 => Severity::Debug,
            9..=12 => Severity::Info,
            13..=16 => Severity::Warn,
            17..=20 => Severity::Error,
            21..=24 => Severity::Fatal,
            _ => Severity::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
            Severity::Unspecified => "unspecified",
        }
    }
}

/// Span-specific metadata kept after normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanMeta {
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub duration_ms: Option<u64>,

    /// Declared downstream service
    pub peer_service: Option<String>,

    pub is_error: bool,
}

/// Severity for logs, span metadata for spans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    Log { severity: Severity },
    Span(SpanMeta),
}

/// A log record or span in the engine's internal shape
///
/// Created once by the normalizer and shared behind `Arc` afterwards; nothing
/// mutates an event after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Unique event id (ULID)
    pub id: String,

    pub service: String,
    pub host: String,
    pub environment: String,

    /// Producer timestamp (event time)
    pub timestamp: DateTime<Utc>,

    /// When the engine normalized the event (processing time)
    pub received_at: DateTime<Utc>,

    pub detail: EventDetail,

    /// Correlation keys, highest priority first; never empty
    pub keys: Vec<CorrelationKey>,

    /// Position of the raw record in its batch, "<batch_id>#<index>"
    pub raw_ref: String,
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        match self.detail {
            EventDetail::Log { .. } => EventKind::Log,
            EventDetail::Span(_) => EventKind::Span,
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self.detail {
            EventDetail::Log { severity } => Some(severity),
            EventDetail::Span(_) => None,
        }
    }

    pub fn span(&self) -> Option<&SpanMeta> {
        match &self.detail {
            EventDetail::Span(meta) => Some(meta),
            EventDetail::Log { .. } => None,
        }
    }

    /// Highest-priority key
    pub fn primary_key(&self) -> Option<&CorrelationKey> {
        self.keys.first()
    }

    pub fn is_unkeyed(&self) -> bool {
        self.keys.iter().all(CorrelationKey::is_unkeyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_text() {
        assert_eq!(Severity::from_text("WARNING"), Severity::Warn);
        assert_eq!(Severity::from_text(" err "), Severity::Error);
        assert_eq!(Severity::from_text("loud"), Severity::Unspecified);
    }

    #[test]
    fn test_severity_number() {
        assert_eq!(Severity::from_number(9), Severity::Info);
        assert_eq!(Severity::from_number(17), Severity::Error);
        assert_eq!(Severity::from_number(24), Severity::Fatal);
        assert_eq!(Severity::from_number(0), Severity::Unspecified);
    }
}
