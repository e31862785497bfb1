//! Per-stage circuit breaker
//!
//! State machine:
//!
//! ```text
//! Closed --N consecutive failures--> Open --cooldown elapsed--> HalfOpen
//!   ^                                  ^                          |
//!   |                                  +------trial fails---------+
//!   +-------------------------trial succeeds----------------------+
//! ```
//!
//! While open every call is rejected without invoking anything. Half-open
//! lets exactly one trial through; other callers are rejected until the
//! trial reports back.

use scorelink_common::config::CircuitBreakerSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::Open => f.write_str("open"),
            BreakerState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// A state change, reported so callers can emit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Breaker rejected the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            name,
            settings.failure_threshold,
            Duration::from_millis(settings.cooldown_ms),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state (an expired cooldown still reads as open until the next call)
    pub fn state(&self) -> BreakerState {
        self.with_inner(|inner| inner.state)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.with_inner(|inner| inner.consecutive_failures)
    }

    /// Whether a call made now would be rejected
    pub fn is_rejecting(&self) -> bool {
        self.is_rejecting_at(Instant::now())
    }

    pub fn is_rejecting_at(&self, now: Instant) -> bool {
        self.with_inner(|inner| match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => !cooldown_elapsed(inner, self.cooldown, now),
            BreakerState::HalfOpen => inner.trial_in_flight,
        })
    }

    /// Ask permission for one call
    pub fn try_acquire(&self) -> Result<Option<Transition>, Rejected> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<Option<Transition>, Rejected> {
        self.with_inner(|inner| {
            let state = inner.state;
            match state {
                BreakerState::Closed => Ok(None),
                BreakerState::Open if cooldown_elapsed(inner, self.cooldown, now) => {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(stage = %self.name, "Circuit breaker half-open, allowing one trial");
                    Ok(Some(Transition {
                        from: BreakerState::Open,
                        to: BreakerState::HalfOpen,
                    }))
                }
                BreakerState::Open => Err(Rejected),
                BreakerState::HalfOpen if inner.trial_in_flight => Err(Rejected),
                BreakerState::HalfOpen => {
                    inner.trial_in_flight = true;
                    Ok(None)
                }
            }
        })
    }

    pub fn record_success(&self) -> Option<Transition> {
        self.with_inner(|inner| {
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            match inner.state {
                BreakerState::Closed => None,
                from => {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    info!(stage = %self.name, "Circuit breaker closed");
                    Some(Transition {
                        from,
                        to: BreakerState::Closed,
                    })
                }
            }
        })
    }

    pub fn record_failure(&self) -> Option<Transition> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> Option<Transition> {
        self.with_inner(|inner| {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.trial_in_flight = false;
            let from = inner.state;
            let open = match from {
                BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
                BreakerState::HalfOpen => true,
                // Late report from a call admitted before the breaker opened
                BreakerState::Open => false,
            };
            if !open {
                return None;
            }
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            warn!(
                stage = %self.name,
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
            Some(Transition {
                from,
                to: BreakerState::Open,
            })
        })
    }

    /// Give back a permit without an outcome (cancelled or non-counting error)
    pub fn release(&self) {
        self.with_inner(|inner| inner.trial_in_flight = false);
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

fn cooldown_elapsed(inner: &Inner, cooldown: Duration, now: Instant) -> bool {
    inner
        .opened_at
        .map_or(true, |opened| now.saturating_duration_since(opened) >= cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("note_images", 3, Duration::from_secs(30))
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let breaker = breaker();
        let now = Instant::now();

        assert!(breaker.record_failure_at(now).is_none());
        assert!(breaker.record_failure_at(now).is_none());
        assert_eq!(breaker.state(), BreakerState::Closed);

        let transition = breaker.record_failure_at(now).unwrap();
        assert_eq!(transition.to, BreakerState::Open);
        assert_eq!(breaker.try_acquire_at(now), Err(Rejected));
        assert!(breaker.is_rejecting_at(now));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breaker = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);
    }

    #[test]
    fn test_half_open_single_trial_then_close() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }

        let later = start + Duration::from_secs(31);
        let transition = breaker.try_acquire_at(later).unwrap().unwrap();
        assert_eq!(transition.to, BreakerState::HalfOpen);
        // A second caller during the trial is rejected
        assert_eq!(breaker.try_acquire_at(later), Err(Rejected));

        let transition = breaker.record_success().unwrap();
        assert_eq!(transition.from, BreakerState::HalfOpen);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_acquire_at(later), Ok(None));
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let breaker = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(start);
        }
        let later = start + Duration::from_secs(31);
        breaker.try_acquire_at(later).unwrap();

        let transition = breaker.record_failure_at(later).unwrap();
        assert_eq!(transition.from, BreakerState::HalfOpen);
        assert_eq!(transition.to, BreakerState::Open);
        // Cooldown restarts from the trial failure
        assert_eq!(
            breaker.try_acquire_at(later + Duration::from_secs(1)),
            Err(Rejected)
        );
    }

    #[test]
    fn test_release_frees_trial_slot() {
        let breaker = CircuitBreaker::new("composite", 1, Duration::ZERO);
        breaker.record_failure();
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.release();
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BreakerState::HalfOpen.to_string(), "half_open");
    }
}
