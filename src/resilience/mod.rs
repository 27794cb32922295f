//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt against an endpoint:
//!     → circuit_breaker.rs (fail fast while open, bounded probes while half-open)
//!     → rate_limiter.rs (spend one token per request in the physical call)
//!     → outcome fed back: breaker counts failures, throttling drains the bucket
//! ```
//!
//! # Design Decisions
//! - One breaker and one bucket per endpoint, never global
//! - Open → Half-Open is evaluated lazily when the endpoint is considered
//! - Upstream rate limiting is not a breaker failure

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState, Transition};
pub use rate_limiter::TokenBucket;
