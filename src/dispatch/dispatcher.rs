//! Failover and racing dispatcher.
//!
//! # Modes
//! - Sequential: walk the ranked candidates, one physical send at a time,
//!   until one succeeds or `max_attempts` sends have failed
//! - Race: send to the top closed-circuit candidates at once under a shared
//!   deadline; the first success wins and the rest are cancelled. A racer
//!   still pending at the deadline fails with a timeout. If nobody wins,
//!   continue sequentially over the remaining candidates
//!
//! Skipped candidates (open circuit, empty bucket, saturated) do not use up
//! an attempt.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};

use crate::config::{DispatchConfig, DispatchMode};
use crate::error::{RpcError, TransportError};
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::{EndpointRegistry, LoadBalancer, Skip};
use crate::resilience::CircuitState;
use crate::transport::RpcTransport;
use crate::types::{CallResult, RpcRequest};

#[derive(Debug)]
enum AttemptError {
    Skipped(Skip),
    Failed(TransportError),
}

impl AttemptError {
    fn describe(&self, endpoint: &str) -> String {
        match self {
            AttemptError::Skipped(Skip::AtCapacity) => {
                format!("endpoint {endpoint} at concurrency limit")
            }
            AttemptError::Skipped(skip) => skip.into_error(endpoint).to_string(),
            AttemptError::Failed(err) => format!("{endpoint}: {err}"),
        }
    }
}

enum RaceOutcome {
    Won(Vec<CallResult>),
    /// No racer succeeded; `failed` of them were actually sent.
    Lost { failed: u32 },
}

#[derive(Debug, Default)]
struct Counters {
    dispatches: AtomicU64,
    attempts: AtomicU64,
    skipped: AtomicU64,
    failovers: AtomicU64,
    races: AtomicU64,
    race_wins: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSnapshot {
    /// Logical dispatches (one per physical request the caller asked for).
    pub dispatches: u64,
    /// Physical sends, including failed ones.
    pub attempts: u64,
    pub skipped: u64,
    /// Dispatches that succeeded after at least one failed send.
    pub failovers: u64,
    pub races: u64,
    pub race_wins: u64,
    /// Dispatches that ran out of candidates.
    pub exhausted: u64,
}

/// Sends physical requests to endpoints chosen by the load balancer.
pub struct Dispatcher {
    registry: Arc<EndpointRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    transport: Arc<dyn RpcTransport>,
    config: DispatchConfig,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        transport: Arc<dyn RpcTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            transport,
            config,
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Send `requests` as one physical call, failing over as needed.
    ///
    /// On success the results line up with `requests`.
    pub async fn execute(
        &self,
        requests: &[RpcRequest],
        timeout: Duration,
    ) -> Result<Vec<CallResult>, RpcError> {
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);
        let ranked = self.balancer.rank(self.registry.all());
        if ranked.is_empty() {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("No eligible endpoint for dispatch");
            return Err(RpcError::Network {
                attempted: Vec::new(),
                cause: "no eligible endpoint".into(),
            });
        }

        let units = u32::try_from(requests.len()).unwrap_or(u32::MAX);
        let mut queue: VecDeque<Arc<Endpoint>> =
            ranked.iter().map(|r| r.endpoint.clone()).collect();
        let mut attempted = Vec::new();
        let mut last_cause = String::new();
        let mut sends = 0u32;

        if self.config.mode == DispatchMode::Race {
            let racers: Vec<Arc<Endpoint>> = ranked
                .iter()
                .filter(|r| r.state == CircuitState::Closed)
                .take(self.config.race_fanout)
                .map(|r| r.endpoint.clone())
                .collect();
            if racers.len() >= 2 {
                queue.retain(|ep| !racers.iter().any(|r| Arc::ptr_eq(r, ep)));
                match self
                    .race(&racers, requests, units, timeout, &mut attempted, &mut last_cause)
                    .await
                {
                    RaceOutcome::Won(results) => return Ok(results),
                    RaceOutcome::Lost { failed } => sends += failed,
                }
            }
        }

        while sends < self.config.max_attempts {
            let Some(ep) = queue.pop_front() else { break };
            attempted.push(ep.id.to_string());
            match self.attempt(&ep, requests, units, timeout).await {
                Ok(results) => {
                    if sends > 0 {
                        self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(endpoint = %ep.id, failed_sends = sends, "Failover succeeded");
                    }
                    return Ok(results);
                }
                Err(err @ AttemptError::Skipped(_)) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    last_cause = err.describe(&ep.id);
                }
                Err(err @ AttemptError::Failed(_)) => {
                    sends += 1;
                    last_cause = err.describe(&ep.id);
                    tracing::debug!(endpoint = %ep.id, cause = %last_cause, "Attempt failed");
                }
            }
        }

        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?attempted, cause = %last_cause, "All endpoint attempts failed");
        Err(RpcError::Network {
            attempted,
            cause: last_cause,
        })
    }

    async fn race(
        &self,
        racers: &[Arc<Endpoint>],
        requests: &[RpcRequest],
        units: u32,
        timeout: Duration,
        attempted: &mut Vec<String>,
        last_cause: &mut String,
    ) -> RaceOutcome {
        self.counters.races.fetch_add(1, Ordering::Relaxed);
        // Each racer is bounded by the race deadline, so one still pending
        // when it passes settles as a timeout.
        let race_timeout = timeout.min(self.config.race_deadline());
        attempted.extend(racers.iter().map(|ep| ep.id.to_string()));

        let mut pending: FuturesUnordered<_> = racers
            .iter()
            .map(|ep| async move { (ep, self.attempt(ep, requests, units, race_timeout).await) })
            .collect();

        let mut failed = 0;
        while let Some((ep, outcome)) = pending.next().await {
            match outcome {
                Ok(results) => {
                    self.counters.race_wins.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(endpoint = %ep.id, "Race won");
                    return RaceOutcome::Won(results);
                }
                Err(err @ AttemptError::Skipped(_)) => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    *last_cause = err.describe(&ep.id);
                }
                Err(err @ AttemptError::Failed(_)) => {
                    failed += 1;
                    *last_cause = err.describe(&ep.id);
                    tracing::debug!(endpoint = %ep.id, cause = %last_cause, "Racer failed");
                }
            }
        }
        RaceOutcome::Lost { failed }
    }

    async fn attempt(
        &self,
        ep: &Arc<Endpoint>,
        requests: &[RpcRequest],
        units: u32,
        timeout: Duration,
    ) -> Result<Vec<CallResult>, AttemptError> {
        let guard = ep.try_begin(units).map_err(AttemptError::Skipped)?;
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let outcome = match tokio::time::timeout(timeout, self.transport.send(ep, requests)).await
        {
            Ok(Ok(results)) if results.len() == requests.len() => Ok(results),
            Ok(Ok(results)) => Err(TransportError::Decode(format!(
                "expected {} responses, got {}",
                requests.len(),
                results.len()
            ))),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Timeout),
        };

        match outcome {
            Ok(results) => {
                guard.succeed();
                Ok(results)
            }
            Err(err) => {
                guard.fail(&err);
                Err(AttemptError::Failed(err))
            }
        }
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        let c = &self.counters;
        DispatchSnapshot {
            dispatches: c.dispatches.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failovers: c.failovers.load(Ordering::Relaxed),
            races: c.races.load(Ordering::Relaxed),
            race_wins: c.race_wins.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{
        AccessConfig, CircuitBreakerConfig, EndpointConfig, RateLimitConfig, SelectorConfig,
    };
    use crate::events::EventBus;
    use crate::load_balancer::ScoredSelector;
    use crate::transport::mock::{echo, Behavior, MockTransport};
    use serde_json::json;
    use tokio::time::Instant;

    pub(crate) fn access_config(weights: &[(&str, u32)]) -> AccessConfig {
        AccessConfig {
            endpoints: weights
                .iter()
                .map(|(name, w)| EndpointConfig::new(*name, format!("http://{name}.test"), *w))
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn dispatcher(
        config: &AccessConfig,
        transport: Arc<MockTransport>,
    ) -> Arc<Dispatcher> {
        let registry =
            Arc::new(EndpointRegistry::new(config, Arc::new(EventBus::new())).unwrap());
        Arc::new(Dispatcher::new(
            registry,
            Arc::new(ScoredSelector::new(SelectorConfig::default())),
            transport,
            config.dispatch.clone(),
        ))
    }

    fn request() -> Vec<RpcRequest> {
        vec![RpcRequest::new("eth_blockNumber", json!([])).unwrap()]
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_sequential_failover() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Fail(TransportError::Status(502)));
        let d = dispatcher(&access_config(&[("a", 3), ("b", 2), ("c", 1)]), transport.clone());

        let reqs = request();
        let results = d.execute(&reqs, TIMEOUT).await.unwrap();
        assert_eq!(results[0], Ok(echo("b", &reqs[0])));
        let order: Vec<String> = transport.calls().into_iter().map(|(ep, _)| ep).collect();
        assert_eq!(order, ["a", "b"]);
        assert_eq!(d.snapshot().failovers, 1);
        assert_eq!(d.registry().get("a").unwrap().snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempted_and_cause() {
        let transport = Arc::new(MockTransport::new());
        for ep in ["a", "b", "c"] {
            transport.set(ep, Behavior::Fail(TransportError::Connection("refused".into())));
        }
        let mut config = access_config(&[("a", 3), ("b", 2), ("c", 1)]);
        config.dispatch.max_attempts = 2;
        let d = dispatcher(&config, transport.clone());

        match d.execute(&request(), TIMEOUT).await {
            Err(RpcError::Network { attempted, cause }) => {
                assert_eq!(attempted, ["a", "b"]);
                assert!(cause.contains("b: connection failed"), "{cause}");
            }
            other => panic!("expected network error, got {other:?}"),
        }
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Hang);
        let mut config = access_config(&[("a", 3), ("b", 1)]);
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let d = dispatcher(&config, transport.clone());

        let start = Instant::now();
        let results = d.execute(&request(), Duration::from_millis(300)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], "b");
        let a = d.registry().get("a").unwrap();
        assert_eq!(a.circuit_state(), CircuitState::Open);
        assert_eq!(a.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_throttle_fails_over_without_breaker_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Fail(TransportError::RateLimited));
        let mut config = access_config(&[("a", 3), ("b", 1)]);
        config.circuit_breaker.failure_threshold = 1;
        let d = dispatcher(&config, transport.clone());

        let results = d.execute(&request(), TIMEOUT).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], "b");
        let a = d.registry().get("a").unwrap();
        assert_eq!(a.circuit_state(), CircuitState::Closed);
        assert!(a.tokens_available() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_first_success_wins() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Respond(Duration::from_millis(500)));
        transport.set("b", Behavior::Respond(Duration::from_millis(20)));
        let mut config = access_config(&[("a", 3), ("b", 2)]);
        config.dispatch.mode = DispatchMode::Race;
        let d = dispatcher(&config, transport.clone());

        let start = Instant::now();
        let results = d.execute(&request(), TIMEOUT).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], "b");
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(transport.call_count(), 2);
        // The cancelled loser keeps a latency sample but no breaker outcome.
        let a = d.registry().get("a").unwrap();
        assert_eq!(a.in_flight(), 0);
        assert_eq!(a.snapshot().failures, 0);
        assert!(a.latency_estimate().is_some());
        assert_eq!(d.snapshot().race_wins, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_race_loser_gets_latency_samples() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Hang);
        transport.set("b", Behavior::Respond(Duration::from_millis(10)));
        let mut config = access_config(&[("a", 3), ("b", 2)]);
        config.dispatch.mode = DispatchMode::Race;
        let d = dispatcher(&config, transport.clone());

        for _ in 0..20 {
            let results = d.execute(&request(), TIMEOUT).await.unwrap();
            assert_eq!(results[0].as_ref().unwrap()["endpoint"], "b");
        }
        let a = d.registry().get("a").unwrap();
        let latency = a.latency_estimate().expect("loser latency recorded");
        assert!(latency >= Duration::from_millis(9), "{latency:?}");
        assert_eq!(a.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racers_pending_at_deadline_fail() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Hang);
        transport.set("b", Behavior::Hang);
        let mut config = access_config(&[("a", 3), ("b", 2), ("c", 1)]);
        config.dispatch.mode = DispatchMode::Race;
        config.dispatch.race_deadline_ms = 200;
        config.circuit_breaker.failure_threshold = 1;
        let d = dispatcher(&config, transport.clone());

        let start = Instant::now();
        let results = d.execute(&request(), TIMEOUT).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], "c");
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < TIMEOUT);
        for id in ["a", "b"] {
            let ep = d.registry().get(id).unwrap();
            assert_eq!(ep.snapshot().failures, 1, "{id}");
            assert_eq!(ep.circuit_state(), CircuitState::Open, "{id}");
            assert!(ep.latency_estimate().is_some(), "{id}");
            assert_eq!(ep.in_flight(), 0, "{id}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_racer_does_not_use_an_attempt() {
        let transport = Arc::new(MockTransport::new());
        transport.set("b", Behavior::Fail(TransportError::Status(500)));
        let mut config = access_config(&[("a", 3), ("b", 2), ("c", 1)]);
        config.dispatch.mode = DispatchMode::Race;
        config.dispatch.max_attempts = 2;
        // One token: eligible for ranking, too small for a two-request send.
        config.endpoints[0].rate_limit = Some(RateLimitConfig {
            capacity: 1.0,
            refill_per_sec: 0.001,
        });
        let d = dispatcher(&config, transport.clone());

        let reqs = vec![
            RpcRequest::new("eth_blockNumber", json!([])).unwrap(),
            RpcRequest::new("eth_chainId", json!([])).unwrap(),
        ];
        let results = d.execute(&reqs, TIMEOUT).await.unwrap();
        assert_eq!(results[1].as_ref().unwrap()["endpoint"], "c");
        let order: Vec<String> = transport.calls().into_iter().map(|(ep, _)| ep).collect();
        assert_eq!(order, ["b", "c"]);
        assert_eq!(d.snapshot().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_falls_back_to_sequential() {
        let transport = Arc::new(MockTransport::new());
        transport.set("a", Behavior::Fail(TransportError::Status(500)));
        transport.set("b", Behavior::Fail(TransportError::Status(500)));
        let mut config = access_config(&[("a", 3), ("b", 2), ("c", 1)]);
        config.dispatch.mode = DispatchMode::Race;
        let d = dispatcher(&config, transport.clone());

        let results = d.execute(&request(), TIMEOUT).await.unwrap();
        assert_eq!(results[0].as_ref().unwrap()["endpoint"], "c");
        assert_eq!(d.snapshot().races, 1);
        assert_eq!(d.snapshot().race_wins, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_race_with_single_healthy_endpoint() {
        let transport = Arc::new(MockTransport::new());
        let mut config = access_config(&[("a", 1)]);
        config.dispatch.mode = DispatchMode::Race;
        let d = dispatcher(&config, transport.clone());

        d.execute(&request(), TIMEOUT).await.unwrap();
        assert_eq!(d.snapshot().races, 0);
        assert_eq!(transport.call_count(), 1);
    }
}
