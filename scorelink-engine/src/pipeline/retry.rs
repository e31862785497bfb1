//! Retry with exponential backoff, and the per-stage resilience wrapper
//!
//! [`ResiliencePolicy::call`] is the one place where retries and circuit
//! breaking are applied to an external invocation:
//!
//! 1. Ask the stage breaker for a permit; if it is open, fail with
//!    `CircuitOpen` without running anything.
//! 2. Run the operation; on a retryable error sleep
//!    `min(base * multiplier^(attempt-1), max)` and try again, up to
//!    `max_attempts` in total.
//! 3. Report the final outcome to the breaker. Only a failure that survived
//!    every retry counts as one breaker failure.

use super::circuit_breaker::{CircuitBreaker, Transition};
use crate::error::StageError;
use scorelink_common::config::RetrySettings;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Backoff before attempt `attempt + 1` (`attempt` starts at 1)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(seconds)
        }
    }
}

/// Outcome of one protected call
#[derive(Debug)]
pub struct CallOutcome<T> {
    pub result: Result<T, StageError>,
    /// Attempts actually made (0 when the breaker rejected the call)
    pub attempts: u32,
    /// Breaker state changes caused by this call
    pub transitions: Vec<Transition>,
}

/// Retry + circuit breaker for one stage
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    stage: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl ResiliencePolicy {
    pub fn new(stage: impl Into<String>, retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            stage: stage.into(),
            retry,
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `operation` (given the 1-based attempt number) under this policy
    pub async fn call<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut transitions = Vec::new();

        match self.breaker.try_acquire() {
            Ok(transition) => transitions.extend(transition),
            Err(_) => {
                tracing::debug!(stage = %self.stage, "Call rejected by open circuit breaker");
                return CallOutcome {
                    result: Err(StageError::CircuitOpen {
                        stage: self.stage.clone(),
                    }),
                    attempts: 0,
                    transitions,
                };
            }
        }

        let mut attempt = 0;
        let result = loop {
            attempt += 1;

            if attempt > 1 {
                tracing::debug!(stage = %self.stage, attempt, "Retrying stage invocation");
            }

            let error = match operation(attempt).await {
                Ok(value) => break Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                break Err(error);
            }

            let backoff = self.retry.delay_after(attempt);
            tracing::warn!(
                stage = %self.stage,
                attempt,
                max_attempts = self.retry.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Stage invocation failed, will retry after backoff"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(StageError::Cancelled { stage: self.stage.clone() });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        };

        match &result {
            Ok(_) => transitions.extend(self.breaker.record_success()),
            Err(error) if error.counts_against_breaker() => {
                tracing::error!(
                    stage = %self.stage,
                    attempts = attempt,
                    error = %error,
                    "Stage invocation failed after retries"
                );
                transitions.extend(self.breaker.record_failure());
            }
            Err(_) => self.breaker.release(),
        }

        CallOutcome {
            result,
            attempts: attempt,
            transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::circuit_breaker::BreakerState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
        }
    }

    fn process_error() -> StageError {
        StageError::Process {
            stage: "note_images".to_string(),
            code: Some(1),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn test_default_matches_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let breaker = Arc::new(CircuitBreaker::new("note_images", 1, Duration::from_secs(60)));
        let policy = ResiliencePolicy::new("note_images", fast_retry(3), breaker.clone());
        let calls = AtomicU32::new(0);

        let outcome = policy
            .call(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(process_error())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result, Ok(3));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Failed attempts inside one call never reach the breaker
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_once() {
        let breaker = Arc::new(CircuitBreaker::new("note_images", 2, Duration::from_secs(60)));
        let policy = ResiliencePolicy::new("note_images", fast_retry(3), breaker.clone());

        let outcome: CallOutcome<()> = policy
            .call(&CancellationToken::new(), |_| async { Err(process_error()) })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.transitions.is_empty());
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_invoking() {
        let breaker = Arc::new(CircuitBreaker::new("audio_render", 1, Duration::from_secs(60)));
        let policy = ResiliencePolicy::new("audio_render", fast_retry(1), breaker.clone());

        let first: CallOutcome<()> = policy
            .call(&CancellationToken::new(), |_| async { Err(process_error()) })
            .await;
        assert_eq!(first.transitions.len(), 1);
        assert_eq!(first.transitions[0].to, BreakerState::Open);

        let calls = AtomicU32::new(0);
        let second: CallOutcome<()> = policy
            .call(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(second.result, Err(StageError::CircuitOpen { .. })));
        assert_eq!(second.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let breaker = Arc::new(CircuitBreaker::new("composite", 3, Duration::from_secs(60)));
        let policy = ResiliencePolicy::new("composite", fast_retry(3), breaker.clone());

        let outcome: CallOutcome<()> = policy
            .call(&CancellationToken::new(), |_| async {
                Err(StageError::InputMissing {
                    stage: "composite".to_string(),
                    missing: vec![],
                })
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let breaker = Arc::new(CircuitBreaker::new("composite", 3, Duration::from_secs(60)));
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
        };
        let policy = ResiliencePolicy::new("composite", retry, breaker.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: CallOutcome<()> = policy
            .call(&cancel, |_| async { Err(process_error()) })
            .await;

        assert!(matches!(outcome.result, Err(StageError::Cancelled { .. })));
        assert_eq!(outcome.attempts, 1);
    }
}
