//! Ingestion queues
//!
//! One bounded queue per telemetry class, many producers and one consumer
//! (the engine loop). A full queue is retried with exponential backoff for a
//! bounded number of attempts; after that the batch is dropped and counted.
//! Producers never block indefinitely.

use std::sync::Arc;
use std::time::Duration;
use telcorr_core::config::IngestSettings;
use telcorr_core::{LogBatch, RawBatch, SharedMetrics, SpanBatch, TelemetryClass};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("{class:?} queue full after {attempts} attempts, batch dropped")]
    Dropped {
        class: TelemetryClass,
        attempts: u32,
    },

    #[error("{class:?} queue closed, engine is shutting down")]
    Closed { class: TelemetryClass },
}

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct EnqueuePolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl EnqueuePolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

/// Producer side of the ingestion queues; cheap to clone
#[derive(Clone)]
pub struct IngestHandle {
    logs: mpsc::Sender<LogBatch>,
    spans: mpsc::Sender<SpanBatch>,
    policy: Arc<EnqueuePolicy>,
    metrics: SharedMetrics,
}

/// Consumer side, owned by the engine loop
pub struct IngestReceivers {
    logs: mpsc::Receiver<LogBatch>,
    spans: mpsc::Receiver<SpanBatch>,
}

/// Result of waiting for the next batch
#[derive(Debug)]
pub enum Next {
    Batch(RawBatch),
    /// Nothing arrived within the timeout
    Idle,
    /// Every producer handle is gone and the queues are empty
    Closed,
}

/// Create both queues
pub fn channels(settings: &IngestSettings, metrics: SharedMetrics) -> (IngestHandle, IngestReceivers) {
    let capacity = settings.queue_capacity.max(1);
    let (logs_tx, logs_rx) = mpsc::channel(capacity);
    let (spans_tx, spans_rx) = mpsc::channel(capacity);

    let handle = IngestHandle {
        logs: logs_tx,
        spans: spans_tx,
        policy: Arc::new(EnqueuePolicy {
            max_attempts: settings.enqueue_max_attempts.max(1),
            backoff: Duration::from_millis(settings.enqueue_backoff_ms),
        }),
        metrics,
    };
    let receivers = IngestReceivers {
        logs: logs_rx,
        spans: spans_rx,
    };
    (handle, receivers)
}

impl IngestHandle {
    pub async fn enqueue_logs(&self, batch: LogBatch) -> IngestResult<()> {
        self.send_with_backoff(&self.logs, batch, TelemetryClass::Logs).await
    }

    pub async fn enqueue_spans(&self, batch: SpanBatch) -> IngestResult<()> {
        self.send_with_backoff(&self.spans, batch, TelemetryClass::Spans).await
    }

    /// Route a batch of either class
    pub async fn enqueue(&self, batch: RawBatch) -> IngestResult<()> {
        match batch {
            RawBatch::Logs(b) => self.enqueue_logs(b).await,
            RawBatch::Spans(b) => self.enqueue_spans(b).await,
        }
    }

    async fn send_with_backoff<T>(
        &self,
        tx: &mpsc::Sender<T>,
        mut batch: T,
        class: TelemetryClass,
    ) -> IngestResult<()> {
        let policy = &self.policy;
        for attempt in 0..policy.max_attempts {
            match tx.try_send(batch) {
                Ok(()) => {
                    self.metrics.record_accepted(class);
                    return Ok(());
                }
                Err(TrySendError::Full(returned)) => {
                    batch = returned;
                    if attempt + 1 < policy.max_attempts {
                        let delay = policy.delay_for(attempt);
                        debug!(?class, attempt = attempt + 1, ?delay, "Queue full, backing off");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    self.metrics.record_dropped(class);
                    return Err(IngestError::Closed { class });
                }
            }
        }

        self.metrics.record_dropped(class);
        warn!(
            ?class,
            attempts = policy.max_attempts,
            dropped_total = self.metrics.dropped(class),
            "Ingestion queue full, batch dropped"
        );
        Err(IngestError::Dropped {
            class,
            attempts: policy.max_attempts,
        })
    }
}

impl IngestReceivers {
    /// Wait up to `timeout` for the first batch of a tick
    pub async fn next(&mut self, timeout: Duration) -> Next {
        let recv = async {
            tokio::select! {
                Some(batch) = self.logs.recv() => Next::Batch(RawBatch::Logs(batch)),
                Some(batch) = self.spans.recv() => Next::Batch(RawBatch::Spans(batch)),
                else => Next::Closed,
            }
        };
        tokio::time::timeout(timeout, recv)
            .await
            .unwrap_or(Next::Idle)
    }

    /// Take up to `cap` already-queued batches of each class without waiting
    pub fn drain_ready(&mut self, cap: usize) -> Vec<RawBatch> {
        let mut batches = Vec::new();
        for _ in 0..cap {
            match self.logs.try_recv() {
                Ok(batch) => batches.push(RawBatch::Logs(batch)),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        for _ in 0..cap {
            match self.spans.try_recv() {
                Ok(batch) => batches.push(RawBatch::Spans(batch)),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        batches
    }

    /// Refuse new batches; already-queued ones stay receivable
    pub fn close(&mut self) {
        self.logs.close();
        self.spans.close();
    }

    /// Everything still queued, after [`close`](Self::close)
    pub fn drain_all(&mut self) -> Vec<RawBatch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.logs.try_recv() {
            batches.push(RawBatch::Logs(batch));
        }
        while let Ok(batch) = self.spans.try_recv() {
            batches.push(RawBatch::Spans(batch));
        }
        batches
    }
}
