//! Summary export for telcorr
//!
//! Sinks, and the delivery machinery around them: a circuit breaker per sink,
//! retry with exponential backoff, and a dead letter queue for everything a
//! sink would not accept.

pub mod audit;
pub mod breaker;
pub mod dlq;
pub mod jsonl;
pub mod manager;
pub mod retry;
pub mod sink;

#[cfg(feature = "webhook")]
pub mod webhook;

pub use audit::AuditSink;
pub use breaker::{BreakerConfig, BreakerOpen, BreakerState, BreakerTransition, CircuitBreaker};
pub use dlq::{
    DeadLetter, DeadLetterQueue, DlqError, DlqResult, MemoryDeadLetterQueue,
    SqliteDeadLetterQueue,
};
pub use jsonl::{JsonlSink, JsonlSinkConfig};
pub use manager::{ExportReport, ExporterManager, ReplayReport, ShutdownReport, SinkOutcome};
pub use retry::{RetryError, RetryOutcome, RetryPolicy, Retryable};
pub use sink::{SinkError, SinkResult, SummarySink};

#[cfg(feature = "webhook")]
pub use webhook::{WebhookSink, WebhookSinkConfig};
