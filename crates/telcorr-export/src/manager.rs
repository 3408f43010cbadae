//! Exporter manager
//!
//! Fans each closed window's summaries out to every sink concurrently. Each
//! sink sits behind its own circuit breaker; inside an admitted call the retry
//! policy governs attempts, each bounded by the call timeout, and the final
//! outcome is recorded once in the breaker. Whatever a sink does not accept
//! goes to the dead letter queue tagged with the sink name and the reason.

use crate::audit::AuditSink;
use crate::breaker::{BreakerConfig, BreakerState, BreakerTransition, CircuitBreaker};
use crate::dlq::{DeadLetter, DeadLetterQueue, DlqResult};
use crate::jsonl::{JsonlSink, JsonlSinkConfig};
use crate::retry::RetryPolicy;
use crate::sink::{SinkError, SinkResult, SummarySink};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use telcorr_core::{CorrelationSummary, EngineConfig, SharedMetrics};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SHUTDOWN_REASON: &str = "export unfinished at shutdown grace deadline";

/// How one sink handled one batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SinkOutcome {
    Delivered { attempts: u32 },
    /// Breaker open; the sink was not called
    ShortCircuited,
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkReport {
    pub sink: String,
    pub outcome: SinkOutcome,
    pub dead_lettered: usize,
}

/// Result of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub sinks: Vec<SinkReport>,
}

impl ExportReport {
    pub fn delivered(&self) -> usize {
        self.sinks
            .iter()
            .filter(|r| matches!(r.outcome, SinkOutcome::Delivered { .. }))
            .count()
    }

    pub fn dead_lettered(&self) -> usize {
        self.sinks.iter().map(|r| r.dead_lettered).sum()
    }

    pub fn for_sink(&self, sink: &str) -> Option<&SinkReport> {
        self.sinks.iter().find(|r| r.sink == sink)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Dispatched exports that finished within the grace period
    pub completed: usize,

    /// Dispatched exports cut off at the deadline
    pub aborted: usize,

    /// Summaries moved to the DLQ for the aborted exports
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub drained: usize,
    pub delivered: usize,

    /// Letters that failed again and went back to the queue
    pub requeued: usize,
}

struct SinkSlot {
    sink: Arc<dyn SummarySink>,
    breaker: CircuitBreaker,
}

/// A dispatched export still tracked by the manager
struct PendingExport {
    summaries: Arc<Vec<CorrelationSummary>>,
    /// Sinks that have neither accepted nor dead-lettered the batch yet
    remaining: Arc<Mutex<HashSet<String>>>,
    handle: JoinHandle<ExportReport>,
}

/// Delivers summaries to all configured sinks
pub struct ExporterManager {
    sinks: Vec<SinkSlot>,
    retry: RetryPolicy,
    breaker_config: BreakerConfig,
    call_timeout: Duration,
    dlq: Arc<dyn DeadLetterQueue>,
    metrics: SharedMetrics,
    transitions: broadcast::Sender<BreakerTransition>,
    pending: Mutex<Vec<PendingExport>>,
}

impl ExporterManager {
    pub fn new(dlq: Arc<dyn DeadLetterQueue>, metrics: SharedMetrics) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            sinks: Vec::new(),
            retry: RetryPolicy::default(),
            breaker_config: BreakerConfig::default(),
            call_timeout: Duration::from_secs(5),
            dlq,
            metrics,
            transitions,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Build the manager and the sinks enabled in the configuration
    pub fn from_config(
        config: &EngineConfig,
        dlq: Arc<dyn DeadLetterQueue>,
        metrics: SharedMetrics,
    ) -> SinkResult<Self> {
        let export = &config.export;
        let call_timeout = Duration::from_millis(export.call_timeout_ms);
        let mut manager = Self::new(dlq, metrics)
            .with_retry(RetryPolicy::from_settings(&config.retry))
            .with_breaker_config(BreakerConfig::from(&config.breaker))
            .with_call_timeout(call_timeout);

        if export.jsonl.enabled {
            manager = manager.with_sink(Arc::new(JsonlSink::open(JsonlSinkConfig::from(
                &export.jsonl,
            ))?));
        }

        if export.webhook.enabled {
            #[cfg(feature = "webhook")]
            {
                use crate::webhook::{WebhookSink, WebhookSinkConfig};
                let sink_config =
                    WebhookSinkConfig::from_export_config(&export.webhook, call_timeout);
                manager = manager.with_sink(Arc::new(WebhookSink::new(sink_config)?));
            }
            #[cfg(not(feature = "webhook"))]
            warn!("Webhook export enabled but telcorr-export was built without the webhook feature");
        }

        if export.audit.enabled {
            manager = manager.with_sink(Arc::new(AuditSink::new()));
        }

        Ok(manager)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Applies to sinks added afterwards
    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a sink with a fresh breaker
    pub fn with_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        let breaker = CircuitBreaker::new(sink.name(), self.breaker_config.clone())
            .with_metrics(self.metrics.clone())
            .with_transitions(self.transitions.clone());
        info!(sink = sink.name(), "Registered summary sink");
        self.sinks.push(SinkSlot { sink, breaker });
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.sink.name()).collect()
    }

    pub fn breaker_state(&self, sink: &str) -> Option<BreakerState> {
        self.slot(sink).map(|s| s.breaker.state())
    }

    /// Force a sink's breaker closed
    pub fn reset_breaker(&self, sink: &str) -> bool {
        match self.slot(sink) {
            Some(slot) => {
                slot.breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Breaker transitions of every sink
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    pub fn dead_letter_queue(&self) -> &Arc<dyn DeadLetterQueue> {
        &self.dlq
    }

    /// Export to every sink and wait for all of them
    pub async fn export_summaries(&self, summaries: &[CorrelationSummary]) -> ExportReport {
        self.fan_out(summaries, None).await
    }

    /// Export in the background; the manager tracks the delivery until it ends
    pub fn dispatch(self: &Arc<Self>, summaries: Vec<CorrelationSummary>) {
        if summaries.is_empty() || self.sinks.is_empty() {
            return;
        }

        let summaries = Arc::new(summaries);
        let remaining = Arc::new(Mutex::new(
            self.sinks
                .iter()
                .map(|s| s.sink.name().to_string())
                .collect::<HashSet<_>>(),
        ));

        let manager = Arc::clone(self);
        let task_summaries = Arc::clone(&summaries);
        let task_remaining = Arc::clone(&remaining);
        let handle = tokio::spawn(async move {
            manager
                .fan_out(&task_summaries, Some(task_remaining.as_ref()))
                .await
        });

        let mut pending = self.pending.lock();
        pending.retain(|p| !p.handle.is_finished());
        pending.push(PendingExport {
            summaries,
            remaining,
            handle,
        });
    }

    /// Dispatched exports that have not finished yet
    pub fn in_flight(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|p| !p.handle.is_finished());
        pending.len()
    }

    /// Wait up to `grace` for dispatched exports, then dead-letter the rest
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut report = ShutdownReport::default();

        for export in pending {
            let mut handle = export.handle;
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                report.completed += 1;
                continue;
            }

            handle.abort();
            let _ = handle.await;
            report.aborted += 1;

            let sinks: Vec<String> = export.remaining.lock().drain().collect();
            for sink in sinks {
                report.dead_lettered += self
                    .dead_letter(&sink, &export.summaries, SHUTDOWN_REASON)
                    .await;
            }
        }

        for slot in &self.sinks {
            if let Err(e) = slot.sink.flush().await {
                warn!(sink = slot.sink.name(), "Flush failed at shutdown: {}", e);
            }
        }

        if report.aborted > 0 {
            warn!(
                "Shutdown grace period expired: {} exports aborted, {} summaries dead-lettered",
                report.aborted, report.dead_lettered
            );
        } else {
            info!("All {} pending exports completed", report.completed);
        }
        report
    }

    /// Drain up to `limit` dead letters and export them again
    ///
    /// Each letter goes back to the sink that failed it. Letters that fail
    /// again are dead-lettered anew; letters for sinks no longer configured
    /// are put back untouched.
    pub async fn replay_dead_letters(&self, limit: usize) -> DlqResult<ReplayReport> {
        let letters = self.dlq.drain(limit).await?;
        let mut report = ReplayReport {
            drained: letters.len(),
            ..Default::default()
        };

        let mut by_sink: BTreeMap<String, Vec<DeadLetter>> = BTreeMap::new();
        for letter in letters {
            by_sink.entry(letter.sink.clone()).or_default().push(letter);
        }

        let mut orphans = Vec::new();
        for (sink, letters) in by_sink {
            let Some(slot) = self.slot(&sink) else {
                warn!(sink = %sink, "Dead letters for unknown sink left in queue");
                orphans.extend(letters);
                continue;
            };

            let summaries: Vec<CorrelationSummary> =
                letters.into_iter().map(|l| l.summary).collect();
            let sink_report = self.export_to_sink(slot, &summaries).await;
            match sink_report.outcome {
                SinkOutcome::Delivered { .. } => report.delivered += summaries.len(),
                _ => report.requeued += sink_report.dead_lettered,
            }
        }

        if !orphans.is_empty() {
            report.requeued += orphans.len();
            self.dlq.enqueue(orphans).await?;
        }

        self.metrics
            .export
            .dead_letters_replayed
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        info!(
            drained = report.drained,
            delivered = report.delivered,
            requeued = report.requeued,
            "Dead letter replay finished"
        );
        Ok(report)
    }

    fn slot(&self, sink: &str) -> Option<&SinkSlot> {
        self.sinks.iter().find(|s| s.sink.name() == sink)
    }

    async fn fan_out(
        &self,
        summaries: &[CorrelationSummary],
        remaining: Option<&Mutex<HashSet<String>>>,
    ) -> ExportReport {
        let calls = self.sinks.iter().map(|slot| async move {
            let report = self.export_to_sink(slot, summaries).await;
            if let Some(remaining) = remaining {
                remaining.lock().remove(slot.sink.name());
            }
            report
        });
        let report = ExportReport {
            sinks: join_all(calls).await,
        };
        debug!(
            summaries = summaries.len(),
            delivered = report.delivered(),
            dead_lettered = report.dead_lettered(),
            "Fan-out finished"
        );
        report
    }

    async fn export_to_sink(&self, slot: &SinkSlot, summaries: &[CorrelationSummary]) -> SinkReport {
        let name = slot.sink.name();
        if summaries.is_empty() {
            return SinkReport {
                sink: name.to_string(),
                outcome: SinkOutcome::Delivered { attempts: 0 },
                dead_lettered: 0,
            };
        }

        let permit = match slot.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                self.metrics
                    .export
                    .short_circuited
                    .fetch_add(1, Ordering::Relaxed);
                debug!(sink = name, "Breaker open, skipping sink");
                let dead_lettered = self.dead_letter(name, summaries, &open.to_string()).await;
                return SinkReport {
                    sink: name.to_string(),
                    outcome: SinkOutcome::ShortCircuited,
                    dead_lettered,
                };
            }
        };

        let timeout = self.call_timeout;
        let sink = &slot.sink;
        let outcome = self
            .retry
            .run(|_| async move {
                match tokio::time::timeout(timeout, sink.export_summaries(summaries)).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout(timeout)),
                }
            })
            .await;

        match outcome.result {
            Ok(()) => {
                permit.success();
                self.metrics
                    .export
                    .summaries_exported
                    .fetch_add(summaries.len() as u64, Ordering::Relaxed);
                SinkReport {
                    sink: name.to_string(),
                    outcome: SinkOutcome::Delivered {
                        attempts: outcome.attempts,
                    },
                    dead_lettered: 0,
                }
            }
            Err(e) => {
                permit.failure();
                self.metrics
                    .export
                    .export_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(sink = name, attempts = outcome.attempts, "Export failed: {}", e);
                let reason = e.to_string();
                let dead_lettered = self.dead_letter(name, summaries, &reason).await;
                SinkReport {
                    sink: name.to_string(),
                    outcome: SinkOutcome::Failed {
                        attempts: outcome.attempts,
                        error: reason,
                    },
                    dead_lettered,
                }
            }
        }
    }

    /// Returns how many summaries were stored
    async fn dead_letter(&self, sink: &str, summaries: &[CorrelationSummary], reason: &str) -> usize {
        let letters: Vec<DeadLetter> = summaries
            .iter()
            .cloned()
            .map(|s| DeadLetter::new(s, sink, reason))
            .collect();
        let count = letters.len();

        match self.dlq.enqueue(letters).await {
            Ok(_) => {
                self.metrics
                    .export
                    .dead_lettered
                    .fetch_add(count as u64, Ordering::Relaxed);
                count
            }
            Err(e) => {
                error!(sink, "Lost {} summaries, dead letter queue failed: {}", count, e);
                0
            }
        }
    }
}
