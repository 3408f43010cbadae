//! Correlation engine - orchestrates the flow from ingestion to export
//!
//! One loop owns the current window. Each tick waits a bounded time for the
//! first queued batch, drains what else is ready, normalizes everything into
//! the window, and closes the window once its duration has elapsed:
//!
//! ```text
//! summarize -> score parents -> stitch state -> index -> dispatch export
//! ```
//!
//! The closed window is swapped out for a fresh one and discarded; it is never
//! reopened. On shutdown the loop stops ticking, drains what was already
//! queued, force-closes the window and gives in-flight exports a grace period
//! before the rest moves to the dead letter queue.

use crate::clock::{Clock, SystemClock};
use crate::ingest::{self, IngestHandle, IngestReceivers, Next};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use telcorr_core::config::ConfigError;
use telcorr_core::metrics::create_metrics;
use telcorr_core::{CorrelationSummary, EngineConfig, RawBatch, SharedMetrics};
use telcorr_correlate::{CorrelationWindow, Normalizer, SummaryIndex, TraceScorer};
use telcorr_export::{dlq, DlqError, ExporterManager, ShutdownReport, SinkError};
use telcorr_state::{StateError, StateManager};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State backend error: {0}")]
    State(#[from] StateError),

    #[error("Dead letter queue error: {0}")]
    Dlq(#[from] DlqError),

    #[error("Sink setup error: {0}")]
    Sink(#[from] SinkError),

    #[error("Invalid window duration: {0:?}")]
    InvalidWindow(Duration),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// What the engine did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineReport {
    pub windows_closed: u64,
    pub summaries: u64,
    pub shutdown: ShutdownReport,
}

/// Control surface for a running engine; cheap to clone
#[derive(Clone)]
pub struct EngineHandle {
    ingest: IngestHandle,
    shutdown_tx: broadcast::Sender<()>,
    index: SummaryIndex,
    exporter: Arc<ExporterManager>,
    metrics: SharedMetrics,
}

impl EngineHandle {
    pub fn ingest(&self) -> &IngestHandle {
        &self.ingest
    }

    pub fn index(&self) -> &SummaryIndex {
        &self.index
    }

    pub fn exporter(&self) -> &Arc<ExporterManager> {
        &self.exporter
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Ask the engine loop to stop
    pub fn shutdown(&self) {
        // Engine already gone is fine
        let _ = self.shutdown_tx.send(());
    }
}

/// The orchestrator; consumed by [`run`](CorrelationEngine::run)
pub struct CorrelationEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    normalizer: Normalizer,
    scorer: TraceScorer,
    window: CorrelationWindow,
    window_duration: chrono::Duration,
    state: Arc<dyn StateManager>,
    state_ttl: Option<Duration>,
    index: SummaryIndex,
    exporter: Arc<ExporterManager>,
    metrics: SharedMetrics,
    receivers: IngestReceivers,
    shutdown_rx: broadcast::Receiver<()>,
    report: EngineReport,
}

impl CorrelationEngine {
    /// Build the engine with the backends and sinks named in the configuration
    pub fn from_config(config: EngineConfig) -> EngineResult<(Self, EngineHandle)> {
        let metrics = create_metrics();
        let state = telcorr_state::from_settings(&config.state)?;
        let dlq = dlq::from_settings(&config.dlq)?;
        let exporter = ExporterManager::from_config(&config, dlq, metrics.clone())?;
        Self::new(config, state, Arc::new(exporter), metrics)
    }

    /// Build the engine around explicit backends
    pub fn new(
        config: EngineConfig,
        state: Arc<dyn StateManager>,
        exporter: Arc<ExporterManager>,
        metrics: SharedMetrics,
    ) -> EngineResult<(Self, EngineHandle)> {
        let std_duration = config.window.duration();
        let window_duration = chrono::Duration::from_std(std_duration)
            .ok()
            .filter(|d| *d > chrono::Duration::zero())
            .ok_or(EngineError::InvalidWindow(std_duration))?;

        let (ingest, receivers) = ingest::channels(&config.ingest, metrics.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let index = SummaryIndex::new(&config.index);
        let state_ttl = match config.state.ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = Self {
            normalizer: Normalizer::from_settings(&config.correlation),
            scorer: TraceScorer::from_settings(&config.correlation),
            window: CorrelationWindow::new(
                clock.now(),
                window_duration,
                config.correlation.weights.clone(),
            ),
            clock,
            window_duration,
            state,
            state_ttl,
            index: index.clone(),
            exporter: exporter.clone(),
            metrics: metrics.clone(),
            receivers,
            shutdown_rx,
            report: EngineReport::default(),
            config,
        };
        let handle = EngineHandle {
            ingest,
            shutdown_tx,
            index,
            exporter,
            metrics,
        };
        Ok((engine, handle))
    }

    /// Take processing time from `clock` instead of the system clock
    ///
    /// Restarts the current window, so call it before any batch is ingested.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.window = CorrelationWindow::new(
            clock.now(),
            self.window_duration,
            self.config.correlation.weights.clone(),
        );
        self.clock = clock;
        self
    }

    /// Run until shut down through the handle or until every handle is gone
    pub async fn run(mut self) -> EngineReport {
        let tick_timeout = Duration::from_millis(self.config.ingest.tick_timeout_ms);
        info!(
            window_secs = self.config.window.duration_secs,
            state = self.state.name(),
            sinks = ?self.exporter.sink_names(),
            "Correlation engine started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Engine shutdown signal received");
                    break;
                }
                next = self.receivers.next(tick_timeout) => next,
            };

            match next {
                Next::Batch(first) => self.tick(Some(first)).await,
                Next::Idle => self.tick(None).await,
                Next::Closed => {
                    info!("All producers gone, stopping");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// One pass of the loop: ingest what is ready, then close if due
    async fn tick(&mut self, first: Option<RawBatch>) {
        let cap = self.config.ingest.per_tick_cap.max(1);
        let batches = first
            .into_iter()
            .chain(self.receivers.drain_ready(cap))
            .collect::<Vec<_>>();

        for batch in batches {
            self.ingest_batch(batch).await;
        }
        self.close_if_due(self.clock.now()).await;
    }

    /// Normalize a batch into the current window
    ///
    /// The window is closed first when it is already due, so every event lands
    /// in the window that is current at its processing time.
    async fn ingest_batch(&mut self, batch: RawBatch) {
        let received_at = self.clock.now();
        self.close_if_due(received_at).await;

        let events = self.normalizer.normalize_batch(&batch, received_at);
        let unkeyed = events.iter().filter(|e| e.is_unkeyed()).count();
        self.metrics
            .ingest
            .events_normalized
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        self.metrics
            .ingest
            .events_unkeyed
            .fetch_add(unkeyed as u64, Ordering::Relaxed);

        for event in events {
            if self.window.add_event(Arc::new(event)).is_err() {
                self.metrics
                    .correlation
                    .invariant_violations
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(
            class = batch.class().as_str(),
            records = batch.len(),
            unkeyed,
            "Batch ingested"
        );
    }

    async fn close_if_due(&mut self, now: DateTime<Utc>) {
        if self.window.should_close(now) {
            self.close_window(now).await;
        }
    }

    /// Close the current window and hand its summaries on
    ///
    /// Returns the number of summaries produced.
    pub(crate) async fn close_window(&mut self, now: DateTime<Utc>) -> usize {
        let fresh = CorrelationWindow::new(
            now,
            self.window_duration,
            self.config.correlation.weights.clone(),
        );
        let mut closing = std::mem::replace(&mut self.window, fresh);

        let mut summaries = match closing.close_and_summarize(now) {
            Ok(summaries) => summaries,
            Err(_) => {
                self.metrics
                    .correlation
                    .invariant_violations
                    .fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };
        let parents = self.scorer.apply(&closing, &mut summaries);
        let window_id = closing.id().to_string();
        let events = closing.event_count();
        closing.discard();

        self.stitch_state(&mut summaries).await;
        self.index.index_all(summaries.iter().cloned(), now);

        let count = summaries.len();
        let correlation = &self.metrics.correlation;
        correlation.windows_closed.fetch_add(1, Ordering::Relaxed);
        correlation
            .summaries_produced
            .fetch_add(count as u64, Ordering::Relaxed);
        correlation
            .parents_inferred
            .fetch_add(parents as u64, Ordering::Relaxed);
        self.report.windows_closed += 1;
        self.report.summaries += count as u64;

        if count > 0 {
            info!(
                window_id = %window_id,
                events,
                summaries = count,
                parents,
                "Window closed"
            );
        } else {
            debug!(window_id = %window_id, "Empty window closed");
        }

        self.exporter.dispatch(summaries);
        count
    }

    /// Carry cross-window state into the summaries
    ///
    /// A failing backend degrades to `windows_seen = 1` with a warning.
    async fn stitch_state(&self, summaries: &mut [CorrelationSummary]) {
        let mut failures = 0u64;
        let mut last_error = None;

        for summary in summaries.iter_mut() {
            if summary.primary_key.is_unkeyed() {
                continue;
            }
            match telcorr_state::stitch(self.state.as_ref(), summary, self.state_ttl).await {
                Ok(entry) => summary.windows_seen = entry.windows_seen,
                Err(e) => {
                    summary.windows_seen = 1;
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            self.metrics
                .correlation
                .state_errors
                .fetch_add(failures, Ordering::Relaxed);
            warn!(
                backend = self.state.name(),
                failures,
                "State unavailable, continuing without cross-window state: {}",
                e
            );
        }

        match self.state.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Expired state entries purged"),
            Err(e) => debug!("State purge failed: {}", e),
        }
    }

    async fn shutdown(mut self) -> EngineReport {
        self.receivers.close();
        let remaining = self.receivers.drain_all();
        if !remaining.is_empty() {
            info!("Draining {} queued batches", remaining.len());
        }
        for batch in remaining {
            self.ingest_batch(batch).await;
        }

        self.window.request_flush();
        self.close_if_due(self.clock.now()).await;

        let grace = Duration::from_millis(self.config.export.shutdown_grace_ms);
        self.report.shutdown = self.exporter.shutdown(grace).await;

        info!(
            windows = self.report.windows_closed,
            summaries = self.report.summaries,
            "Correlation engine stopped"
        );
        self.report
    }
}
