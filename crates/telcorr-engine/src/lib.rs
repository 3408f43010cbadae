//! telcorr engine - ingestion queues and the correlation loop
//!
//! Producers push log and span batches through an [`IngestHandle`]; the
//! [`CorrelationEngine`] groups them into processing-time windows, summarizes
//! each window per correlation key and hands the summaries to the exporter.

pub mod clock;
pub mod engine;
pub mod ingest;

pub use clock::{Clock, SystemClock};
pub use engine::{CorrelationEngine, EngineError, EngineHandle, EngineReport, EngineResult};
pub use ingest::{IngestError, IngestHandle, IngestResult};
