//! Retry with exponential backoff
//!
//! A counted loop: attempt, and on a retryable failure sleep
//! `initial_delay * 2^attempt` (capped at `max_delay`) before the next one.
//! The outcome reports how many attempts were made.

use crate::sink::SinkError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use telcorr_core::config::RetrySettings;
use thiserror::Error;
use tracing::{debug, warn};

/// Classifies failures for the retry loop
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SinkError {
    fn is_retryable(&self) -> bool {
        SinkError::is_retryable(self)
    }
}

/// Terminal failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("Permanent failure on attempt {attempt}: {error}")]
    Permanent { attempt: u32, error: E },
}

impl<E: fmt::Display> RetryError<E> {
    /// The error of the final attempt
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }
}

/// Result of a retried operation plus the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T, E: fmt::Display> {
    pub attempts: u32,
    pub result: Result<T, RetryError<E>>,
}

impl<T, E: fmt::Display> RetryOutcome<T, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Upper bound on a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// Delay after failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RetryOutcome<T, E>
    where
        E: Retryable + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        attempts: attempt + 1,
                        result: Ok(value),
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                warn!("Permanent failure on attempt {}: {}", attempt + 1, error);
                return RetryOutcome {
                    attempts: attempt + 1,
                    result: Err(RetryError::Permanent {
                        attempt: attempt + 1,
                        error,
                    }),
                };
            }

            if attempt + 1 >= self.max_attempts {
                return RetryOutcome {
                    attempts: attempt + 1,
                    result: Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: error,
                    }),
                };
            }

            let delay = self.delay_for(attempt);
            warn!(
                "Attempt {} failed, retrying in {:?}: {}",
                attempt + 1,
                delay,
                error
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_with_backoff() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let stamps = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let outcome: RetryOutcome<(), SinkError> = policy
            .run(|_| {
                let calls = calls.clone();
                let stamps = stamps.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    stamps.lock().push(started.elapsed());
                    Err(SinkError::Transient("down".to_string()))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            outcome.result,
            Err(RetryError::Exhausted { attempts: 4, .. })
        ));
        assert_eq!(
            *stamps.lock(),
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(700),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(30));
        let outcome: RetryOutcome<(), SinkError> = policy
            .run(|_| async { Err(SinkError::Http { status: 400, body: "bad".to_string() }) })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(
            outcome.result,
            Err(RetryError::Permanent { attempt: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retry() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1));
        let outcome: RetryOutcome<&str, SinkError> = policy
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(SinkError::Transient("flaky".to_string()))
                } else {
                    Ok("delivered")
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), "delivered");
    }
}
