//! Per-sink circuit breaker
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open --(recovery_timeout since last failure)--> HalfOpen (one trial)
//! HalfOpen --trial ok--> Closed
//! HalfOpen --trial failed--> Open (timer restarted)
//! ```
//!
//! Callers take a [`BreakerPermit`] before a call and settle it with the
//! call's final outcome. A permit dropped unsettled counts as a failure, so a
//! cancelled trial cannot leave the breaker stuck half-open.
//!
//! Every transition starts a new generation. Permits remember the generation
//! they were issued in, and outcomes from an earlier generation are ignored:
//! a call admitted while Closed cannot settle the half-open trial or restart
//! the recovery timer of an Open breaker.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use telcorr_core::config::BreakerSettings;
use telcorr_core::SharedMetrics;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// A state change, published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub sink: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

/// Returned when the breaker refuses a call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit open for sink {sink}")]
pub struct BreakerOpen {
    pub sink: String,
}

/// Breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(settings.recovery_timeout_ms),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

/// Circuit breaker guarding one sink
pub struct CircuitBreaker {
    sink: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: broadcast::Sender<BreakerTransition>,
    metrics: Option<SharedMetrics>,
}

impl CircuitBreaker {
    pub fn new(sink: impl Into<String>, config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            sink: sink.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
                generation: 0,
            }),
            transitions,
            metrics: None,
        }
    }

    /// Count transitions in the engine metrics
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish transitions on a channel shared with other breakers
    pub fn with_transitions(mut self, transitions: broadcast::Sender<BreakerTransition>) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without advancing Open to HalfOpen
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Receive every future state change
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Ask to make one call
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, BreakerOpen> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return Err(self.open_error());
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    /// Force the breaker closed (operator action)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        if inner.state != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        } else {
            inner.generation += 1;
        }
    }

    /// Whether an outcome from `permit` may still change the breaker
    fn is_current(&self, inner: &BreakerInner, generation: u64, trial: bool) -> bool {
        let current = generation == inner.generation
            && (inner.state != BreakerState::HalfOpen || trial);
        if !current {
            debug!(
                sink = %self.sink,
                state = %inner.state,
                "Ignoring outcome of a call admitted before the last transition"
            );
        }
        current
    }

    fn record_success(&self, generation: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if !self.is_current(&inner, generation, trial) {
            return;
        }
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state == BreakerState::HalfOpen {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    fn record_failure(&self, generation: u64, trial: bool) {
        let mut inner = self.inner.lock();
        if !self.is_current(&inner, generation, trial) {
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open),
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;

        if to == BreakerState::Open {
            warn!(
                sink = %self.sink,
                failures = inner.consecutive_failures,
                "Circuit breaker {} -> {}", from, to
            );
        } else {
            info!(sink = %self.sink, "Circuit breaker {} -> {}", from, to);
        }
        if let Some(metrics) = &self.metrics {
            metrics.export.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        }
        // No subscribers is fine
        let _ = self.transitions.send(BreakerTransition {
            sink: self.sink.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    fn open_error(&self) -> BreakerOpen {
        BreakerOpen {
            sink: self.sink.clone(),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("sink", &self.sink)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Permission for one call; settle it with the call's outcome
#[must_use = "an unsettled permit is recorded as a failure"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation, self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.generation, self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.generation, self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "sink-a",
            BreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
            },
        )
    }

    fn fail(b: &CircuitBreaker) {
        b.try_acquire().unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker();
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        fail(&b);
        fail(&b);
        b.try_acquire().unwrap().success();
        assert_eq!(b.consecutive_failures(), 0);
        fail(&b);
        fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_cycle() {
        let b = breaker();
        let mut events = b.subscribe();
        for _ in 0..3 {
            fail(&b);
        }

        // Still within the recovery timeout
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.try_acquire().is_err());

        // Exactly one trial after the timeout
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_err());

        // Failed trial reopens and restarts the timer
        trial.failure();
        assert_eq!(b.state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(b.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;

        // Successful trial closes with the counter reset
        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);

        let mut seen = Vec::new();
        while let Ok(t) = events.try_recv() {
            seen.push((t.from, t.to));
        }
        assert_eq!(
            seen,
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
                (BreakerState::HalfOpen, BreakerState::Open),
                (BreakerState::Open, BreakerState::HalfOpen),
                (BreakerState::HalfOpen, BreakerState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        {
            let _trial = b.try_acquire().unwrap();
        }
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b);
        }
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok_and(|p| {
            p.success();
            true
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_success_cannot_settle_trial() {
        let b = breaker();
        let stale = b.try_acquire().unwrap();
        assert!(!stale.is_trial());
        for _ in 0..3 {
            fail(&b);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        stale.success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_err());

        trial.success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_keeps_recovery_timer() {
        let b = breaker();
        let stale = b.try_acquire().unwrap();
        for _ in 0..3 {
            fail(&b);
        }

        tokio::time::advance(Duration::from_secs(20)).await;
        stale.failure();
        assert_eq!(b.state(), BreakerState::Open);

        // Recovery still counts from the failure that opened the breaker
        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        trial.success();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permits_from_before_reset_are_ignored() {
        let b = breaker();
        let stale: Vec<_> = (0..3).map(|_| b.try_acquire().unwrap()).collect();
        b.reset();
        for permit in stale {
            permit.failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }
}
