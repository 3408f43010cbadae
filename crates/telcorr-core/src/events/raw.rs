//! Raw ingest batches as handed over by transport collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Shared resource block carried by every batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceContext {
    /// Producing service name
    pub service: String,

    /// Host the producer runs on
    #[serde(default)]
    pub host: String,

    /// Deployment environment (e.g. "prod", "staging")
    #[serde(default)]
    pub environment: String,
}

impl ResourceContext {
    pub fn new(
        service: impl Into<String>,
        host: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
            environment: environment.into(),
        }
    }

    /// Resource context for a producer running on this machine
    pub fn local(service: impl Into<String>, environment: impl Into<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Self::new(service, host, environment)
    }
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self::new("unknown_service", "", "")
    }
}

/// A discrete log record before normalization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLogRecord {
    /// Producer timestamp
    pub timestamp: Option<DateTime<Utc>>,

    /// Severity as text ("WARN", "error", ...)
    pub severity_text: Option<String>,

    /// Severity as an OpenTelemetry severity number (1-24)
    pub severity_number: Option<i32>,

    /// Log message
    pub body: Option<String>,

    /// Trace context, when the producer propagates it
    pub trace_id: Option<String>,
    pub span_id: Option<String>,

    /// Free-form attributes (business identifiers live here)
    pub attributes: HashMap<String, serde_json::Value>,
}

/// A trace span before normalization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSpan {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,

    /// Operation name
    pub name: String,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    /// Status code text ("ok", "error", "unset")
    pub status: Option<String>,

    /// Downstream service this span calls into
    pub peer_service: Option<String>,

    pub attributes: HashMap<String, serde_json::Value>,
}

/// A batch of log records sharing one resource block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default = "new_batch_id")]
    pub batch_id: String,
    pub resource: ResourceContext,
    #[serde(default)]
    pub records: Vec<RawLogRecord>,
}

impl LogBatch {
    pub fn new(resource: ResourceContext, records: Vec<RawLogRecord>) -> Self {
        Self {
            batch_id: new_batch_id(),
            resource,
            records,
        }
    }
}

/// A batch of spans sharing one resource block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanBatch {
    #[serde(default = "new_batch_id")]
    pub batch_id: String,
    pub resource: ResourceContext,
    #[serde(default)]
    pub spans: Vec<RawSpan>,
}

impl SpanBatch {
    pub fn new(resource: ResourceContext, spans: Vec<RawSpan>) -> Self {
        Self {
            batch_id: new_batch_id(),
            resource,
            spans,
        }
    }
}

/// Telemetry class, one ingestion queue per class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryClass {
    Logs,
    Spans,
}

impl TelemetryClass {
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryClass::Logs => "logs",
            TelemetryClass::Spans => "spans",
        }
    }
}

/// Either kind of batch, as stored in replay files (one JSON object per line)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum RawBatch {
    Logs(LogBatch),
    Spans(SpanBatch),
}

impl RawBatch {
    pub fn class(&self) -> TelemetryClass {
        match self {
            RawBatch::Logs(_) => TelemetryClass::Logs,
            RawBatch::Spans(_) => TelemetryClass::Spans,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawBatch::Logs(b) => b.records.len(),
            RawBatch::Spans(b) => b.spans.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_batch_id() -> String {
    ulid::Ulid::new().to_string()
}
