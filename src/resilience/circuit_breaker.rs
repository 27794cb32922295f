//! Circuit breaker for endpoint protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: endpoint assumed down, requests fail fast
//! - Half-Open: a bounded number of probes test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold failures within window
//! Open → Half-Open: cooldown elapsed (checked lazily on admission)
//! Half-Open → Closed: consecutive_successes_required probe successes
//! Half-Open → Open: any probe failure (cooldown restarts)
//! ```
//!
//! All state lives behind one mutex so the transitions stay linearizable
//! under concurrent outcomes.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric form for gauges (0=closed, 1=half-open, 2=open).
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// How a call was let through, needed to attribute its outcome later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed circuit.
    Normal,
    /// Probe occupying one half-open trial slot.
    Probe,
}

/// A state change caused by an admission or an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Result of a non-reserving availability check.
#[derive(Debug, Clone, Copy)]
pub struct Availability {
    pub state: CircuitState,
    /// Whether `try_admit` would currently succeed.
    pub admits: bool,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub probes_in_flight: u32,
    pub probe_successes: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

impl Inner {
    fn move_to(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        match to {
            CircuitState::Closed => {
                self.failures = 0;
                self.window_start = None;
                self.opened_at = None;
                self.probe_successes = 0;
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.probe_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.probe_successes = 0;
            }
        }
        Some(Transition { from, to })
    }
}

/// Per-endpoint circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open → Half-Open once the cooldown is over.
    fn promote(&self, inner: &mut Inner, now: Instant) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let cooled = inner
            .opened_at
            .map_or(true, |at| now.duration_since(at) >= self.config.cooldown());
        if cooled {
            inner.move_to(CircuitState::HalfOpen, now)
        } else {
            None
        }
    }

    /// Raw state without cooldown promotion.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Report the effective state without reserving a probe slot.
    pub fn availability(&self) -> Availability {
        let now = Instant::now();
        let mut inner = self.lock();
        let transition = self.promote(&mut inner, now);
        let admits = match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.probes_in_flight < self.config.half_open_trial_limit,
            CircuitState::Open => false,
        };
        Availability {
            state: inner.state,
            admits,
            transition,
        }
    }

    /// Let a call through if the state allows it.
    pub fn try_admit(&self) -> (Option<Admission>, Option<Transition>) {
        let now = Instant::now();
        let mut inner = self.lock();
        let transition = self.promote(&mut inner, now);
        let admission = match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen
                if inner.probes_in_flight < self.config.half_open_trial_limit =>
            {
                inner.probes_in_flight += 1;
                Some(Admission::Probe)
            }
            _ => None,
        };
        (admission, transition)
    }

    pub fn record_success(&self, admission: Admission) -> Option<Transition> {
        let now = Instant::now();
        let mut inner = self.lock();
        match admission {
            Admission::Normal => {
                if inner.state == CircuitState::Closed {
                    inner.failures = 0;
                    inner.window_start = None;
                }
                None
            }
            Admission::Probe => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                if inner.state != CircuitState::HalfOpen {
                    return None;
                }
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.consecutive_successes_required {
                    inner.move_to(CircuitState::Closed, now)
                } else {
                    None
                }
            }
        }
    }

    pub fn record_failure(&self, admission: Admission) -> Option<Transition> {
        let now = Instant::now();
        let mut inner = self.lock();
        match admission {
            Admission::Normal => {
                // Outcomes of calls admitted before the circuit opened are ignored.
                if inner.state != CircuitState::Closed {
                    return None;
                }
                let expired = inner
                    .window_start
                    .map_or(true, |start| now.duration_since(start) > self.config.window());
                if expired {
                    inner.failures = 0;
                    inner.window_start = Some(now);
                }
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.move_to(CircuitState::Open, now)
                } else {
                    None
                }
            }
            Admission::Probe => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                match inner.state {
                    CircuitState::HalfOpen => inner.move_to(CircuitState::Open, now),
                    _ => None,
                }
            }
        }
    }

    /// Give back an admission whose call ended without an outcome.
    pub fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            let mut inner = self.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            probes_in_flight: inner.probes_in_flight,
            probe_successes: inner.probe_successes,
        }
    }
}
