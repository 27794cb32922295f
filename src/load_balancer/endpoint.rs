//! Endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single upstream provider
//! - Own the provider's circuit breaker and token bucket
//! - Track in-flight calls, outcomes and a rolling latency estimate
//! - Hand out RAII attempt guards that enforce the concurrency cap

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::config::{CircuitBreakerConfig, EndpointConfig, RateLimitConfig};
use crate::error::{RpcError, TransportError};
use crate::events::{AccessEvent, EventBus};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{Availability, BreakerSnapshot};
use crate::resilience::rate_limiter::BucketSnapshot;
use crate::resilience::{Admission, CircuitBreaker, CircuitState, TokenBucket, Transition};

/// Weight given to the newest sample in the latency EWMA.
const LATENCY_ALPHA: f64 = 0.2;

/// Sentinel for "no latency sample yet".
const NO_LATENCY: u64 = u64::MAX;

/// Why an endpoint could not take an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    CircuitOpen,
    RateLimited,
    AtCapacity,
}

impl Skip {
    pub fn into_error(self, endpoint: &str) -> RpcError {
        match self {
            Skip::CircuitOpen => RpcError::CircuitOpen {
                endpoint: endpoint.to_string(),
            },
            Skip::RateLimited | Skip::AtCapacity => RpcError::RateLimited {
                endpoint: endpoint.to_string(),
            },
        }
    }
}

/// A single upstream provider.
#[derive(Debug)]
pub struct Endpoint {
    /// Unique name from configuration.
    pub id: Arc<str>,
    pub url: Url,
    /// Static weight.
    pub weight: u32,
    pub max_concurrency: usize,

    breaker: CircuitBreaker,
    bucket: TokenBucket,
    events: Arc<EventBus>,

    in_flight: AtomicUsize,
    successes: AtomicU64,
    failures: AtomicU64,
    /// EWMA latency in microseconds, stored as `f64` bits.
    latency_us: AtomicU64,
    /// Smooth weighted rotation credit used by the selector.
    credit: AtomicI64,
}

impl Endpoint {
    pub fn new(
        config: &EndpointConfig,
        url: Url,
        breaker: CircuitBreakerConfig,
        default_rate: RateLimitConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let rate = config.rate_limit.unwrap_or(default_rate);
        Self {
            id: Arc::from(config.name.as_str()),
            url,
            weight: config.weight,
            max_concurrency: config.max_concurrency,
            breaker: CircuitBreaker::new(breaker),
            bucket: TokenBucket::new(rate),
            events,
            in_flight: AtomicUsize::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latency_us: AtomicU64::new(NO_LATENCY),
            credit: AtomicI64::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Free concurrency fraction in `[0, 1]`.
    pub fn free_capacity(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 0.0;
        }
        let used = self.in_flight().min(self.max_concurrency) as f64;
        1.0 - used / self.max_concurrency as f64
    }

    pub fn success_ratio(&self) -> f64 {
        let ok = self.successes.load(Ordering::Relaxed);
        let failed = self.failures.load(Ordering::Relaxed);
        if ok + failed == 0 {
            1.0
        } else {
            ok as f64 / (ok + failed) as f64
        }
    }

    pub fn latency_estimate(&self) -> Option<Duration> {
        let bits = self.latency_us.load(Ordering::Relaxed);
        (bits != NO_LATENCY).then(|| Duration::from_secs_f64(f64::from_bits(bits) / 1e6))
    }

    fn record_latency(&self, sample: Duration) {
        let sample_us = sample.as_secs_f64() * 1e6;
        let _ = self
            .latency_us
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let next = if bits == NO_LATENCY {
                    sample_us
                } else {
                    let prev = f64::from_bits(bits);
                    prev + LATENCY_ALPHA * (sample_us - prev)
                };
                Some(next.to_bits())
            });
    }

    pub fn rate_headroom(&self) -> f64 {
        self.bucket.headroom()
    }

    pub fn tokens_available(&self) -> f64 {
        self.bucket.available()
    }

    pub fn token_capacity(&self) -> f64 {
        self.bucket.capacity()
    }

    /// Effective breaker state, applying any due Open → Half-Open change.
    pub fn availability(&self) -> Availability {
        let availability = self.breaker.availability();
        self.observe(availability.transition);
        availability
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.availability().state
    }

    /// Healthy means the circuit is not open.
    pub fn is_healthy(&self) -> bool {
        self.circuit_state() != CircuitState::Open
    }

    pub(crate) fn credit(&self) -> i64 {
        self.credit.load(Ordering::Relaxed)
    }

    pub(crate) fn adjust_credit(&self, delta: i64, bound: i64) {
        let _ = self
            .credit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some((c + delta).clamp(-bound, bound))
            });
    }

    /// Reserve a concurrency slot, breaker admission and `units` tokens.
    pub fn try_begin(self: &Arc<Self>, units: u32) -> Result<AttemptGuard, Skip> {
        let mut prev = self.in_flight.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_concurrency {
                return Err(Skip::AtCapacity);
            }
            match self.in_flight.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }

        let (admission, transition) = self.breaker.try_admit();
        self.observe(transition);
        let Some(admission) = admission else {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Skip::CircuitOpen);
        };

        if !self.bucket.try_consume(units) {
            self.breaker.release(admission);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(Skip::RateLimited);
        }

        Ok(AttemptGuard {
            endpoint: self.clone(),
            admission,
            started: Instant::now(),
            settled: false,
        })
    }

    fn observe(&self, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        match t.to {
            CircuitState::Open => {
                tracing::warn!(endpoint = %self.id, from = t.from.as_str(), "Circuit opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = %self.id, "Circuit half-open, probing")
            }
            CircuitState::Closed => tracing::info!(endpoint = %self.id, "Circuit closed"),
        }
        metrics::record_circuit_state(&self.id, t.to);
        self.events.publish(AccessEvent::CircuitTransition {
            endpoint: self.id.to_string(),
            from: t.from,
            to: t.to,
        });
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let circuit = self.breaker.snapshot();
        EndpointSnapshot {
            id: self.id.to_string(),
            url: self.url.to_string(),
            weight: self.weight,
            healthy: circuit.state != CircuitState::Open,
            circuit,
            rate_limit: self.bucket.snapshot(),
            in_flight: self.in_flight(),
            max_concurrency: self.max_concurrency,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            success_ratio: self.success_ratio(),
            latency_ms: self.latency_estimate().map(|d| d.as_secs_f64() * 1e3),
        }
    }
}

/// Point-in-time view of an endpoint for stats and the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: String,
    pub url: String,
    pub weight: u32,
    pub healthy: bool,
    pub circuit: BreakerSnapshot,
    pub rate_limit: BucketSnapshot,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub successes: u64,
    pub failures: u64,
    pub success_ratio: f64,
    pub latency_ms: Option<f64>,
}

/// A RAII guard for one attempt against an endpoint.
///
/// Settle it with [`succeed`](Self::succeed) or [`fail`](Self::fail). Dropping it
/// unsettled (a cancelled race loser) frees the slot and records the time spent
/// as a latency sample, but no breaker outcome.
#[derive(Debug)]
pub struct AttemptGuard {
    endpoint: Arc<Endpoint>,
    admission: Admission,
    started: Instant,
    settled: bool,
}

impl AttemptGuard {
    pub fn succeed(mut self) {
        self.settled = true;
        let ep = &self.endpoint;
        let latency = self.started.elapsed();
        ep.record_latency(latency);
        ep.successes.fetch_add(1, Ordering::Relaxed);
        metrics::record_attempt(&ep.id, "success", latency);
        let transition = ep.breaker.record_success(self.admission);
        ep.observe(transition);
    }

    pub fn fail(mut self, error: &TransportError) {
        self.settled = true;
        let ep = &self.endpoint;
        let latency = self.started.elapsed();
        ep.record_latency(latency);
        if error.counts_as_failure() {
            ep.failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_attempt(&ep.id, "failure", latency);
            let transition = ep.breaker.record_failure(self.admission);
            ep.observe(transition);
        } else {
            metrics::record_attempt(&ep.id, "throttled", latency);
            tracing::warn!(endpoint = %ep.id, "Upstream rate limited, draining bucket");
            ep.bucket.drain();
            ep.breaker.release(self.admission);
            ep.events.publish(AccessEvent::UpstreamThrottled {
                endpoint: ep.id.to_string(),
            });
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.settled {
            let ep = &self.endpoint;
            let latency = self.started.elapsed();
            ep.record_latency(latency);
            metrics::record_attempt(&ep.id, "cancelled", latency);
            ep.breaker.release(self.admission);
        }
        self.endpoint.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
