//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatch needs a target
//!     → registry.rs (all endpoints, declared order)
//!     → selector.rs (filter ineligible, score, order)
//!     → endpoint.rs (reserve slot + breaker admission + tokens)
//!     → Return attempt guard or skip reason
//! ```
//!
//! # Design Decisions
//! - Selection returns the whole fallback order, not just a winner
//! - Open circuits, empty buckets and saturated endpoints are never candidates
//! - Endpoint state is lock-free except breaker and bucket, each behind its own mutex

pub mod endpoint;
pub mod registry;
pub mod selector;

use std::sync::Arc;

use crate::resilience::CircuitState;
use endpoint::Endpoint;

pub use endpoint::{AttemptGuard, EndpointSnapshot, Skip};
pub use registry::EndpointRegistry;
pub use selector::ScoredSelector;

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct RankedEndpoint {
    pub endpoint: Arc<Endpoint>,
    pub score: f64,
    pub state: CircuitState,
}

/// Orders eligible endpoints, best first.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn rank(&self, endpoints: &[Arc<Endpoint>]) -> Vec<RankedEndpoint>;
}
