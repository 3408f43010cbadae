//! telcorr core - event model, time-window utilities, configuration and metrics
//!
//! This crate provides the foundational types shared by every telcorr crate:
//!
//! - **Events**: raw ingest batches, normalized events, correlation keys and summaries
//! - **Time windows**: pure bucketing functions
//! - **Config**: TOML configuration with environment overrides
//! - **Metrics**: operator-visible counters (drops, breaker transitions, dead letters)

pub mod config;
pub mod events;
pub mod metrics;
pub mod timewindow;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, EngineConfig};
pub use events::{
    CorrelationKey, CorrelationSummary, EventDetail, EventKind, KeyKind, LogBatch,
    NormalizedEvent, ParentLink, RawBatch, RawLogRecord, RawSpan, ResourceContext, Severity,
    SpanBatch, SpanMeta, TelemetryClass,
};
pub use metrics::{EngineMetrics, SharedMetrics};

/// Engine version
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
