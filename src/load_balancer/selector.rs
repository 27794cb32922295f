//! Weighted multi-factor endpoint scoring.
//!
//! # Score
//! ```text
//! capacity   (1 - in_flight / max_concurrency)^2
//! latency    min(1, target / observed)           (1 before the first sample)
//! rate_limit tokens / capacity
//! success    successes / (successes + failures)   (1 before the first outcome)
//! priority   static weight share via rotation credit
//! breaker    1 when closed, 0 when half-open
//! ```
//! Each factor is in `[0, 1]` and multiplied by its configured weight.
//!
//! The priority factor uses smooth weighted round-robin credit: every ranking
//! adds each candidate's weight to its credit and the winner pays back the
//! candidates' total weight. With the other factors equal, selections follow the
//! static weight ratio exactly; bounded perturbations from the dynamic factors
//! are paid back through the credit, so long-run shares still converge.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::config::SelectorConfig;
use crate::load_balancer::endpoint::Endpoint;
use crate::load_balancer::{LoadBalancer, RankedEndpoint};
use crate::resilience::CircuitState;

/// Scoring selector with hot-swappable weights.
#[derive(Debug)]
pub struct ScoredSelector {
    config: ArcSwap<SelectorConfig>,
}

impl ScoredSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn config(&self) -> Arc<SelectorConfig> {
        self.config.load_full()
    }

    /// Replace the scoring weights without blocking concurrent rankings.
    pub fn update(&self, config: SelectorConfig) {
        tracing::info!(weights = ?config.weights, "Selector weights updated");
        self.config.store(Arc::new(config));
    }
}

impl LoadBalancer for ScoredSelector {
    fn rank(&self, endpoints: &[Arc<Endpoint>]) -> Vec<RankedEndpoint> {
        let config = self.config.load();
        let w = &config.weights;
        let target = config.target_latency_ms.max(1) as f64 / 1e3;

        let candidates: Vec<(&Arc<Endpoint>, CircuitState)> = endpoints
            .iter()
            .filter_map(|ep| {
                let availability = ep.availability();
                let eligible = availability.admits
                    && ep.tokens_available() >= 1.0
                    && ep.in_flight() < ep.max_concurrency;
                eligible.then_some((ep, availability.state))
            })
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let total_weight: i64 = candidates
            .iter()
            .map(|(ep, _)| i64::from(ep.weight))
            .sum::<i64>()
            .max(1);
        let bound = 2 * total_weight;
        for (ep, _) in &candidates {
            ep.adjust_credit(i64::from(ep.weight), bound);
        }

        let mut ranked: Vec<RankedEndpoint> = candidates
            .into_iter()
            .map(|(ep, state)| {
                let capacity = ep.free_capacity().powi(2);
                let latency = ep
                    .latency_estimate()
                    .map_or(1.0, |l| (target / l.as_secs_f64().max(1e-6)).min(1.0));
                let share = (ep.credit() as f64 / bound as f64 + 1.0) / 2.0;
                let breaker = if state == CircuitState::Closed { 1.0 } else { 0.0 };
                let score = w.capacity * capacity
                    + w.latency * latency
                    + w.rate_limit * ep.rate_headroom()
                    + w.success * ep.success_ratio()
                    + w.priority * share.clamp(0.0, 1.0)
                    + w.breaker_bonus * breaker;
                RankedEndpoint {
                    endpoint: ep.clone(),
                    score,
                    state,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.endpoint.weight.cmp(&a.endpoint.weight))
        });

        if let Some(winner) = ranked.first() {
            winner.endpoint.adjust_credit(-total_weight, bound);
        }
        ranked
    }
}
