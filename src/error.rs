//! Error types surfaced by the access layer.

use thiserror::Error;

use crate::types::Priority;

/// Errors returned to callers of [`RpcClient::call`](crate::client::RpcClient::call).
///
/// Cloneable so a single shared outcome can be handed to every deduplicated caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// Every candidate endpoint failed or was skipped.
    #[error("all endpoints failed (attempted: {attempted:?}): {cause}")]
    Network { attempted: Vec<String>, cause: String },

    /// The endpoint's token bucket is empty.
    #[error("endpoint {endpoint} is rate limited")]
    RateLimited { endpoint: String },

    /// The endpoint's circuit breaker is open.
    #[error("circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Admission control shed the call.
    #[error("rejected {priority} priority call at {utilization:.2} utilization")]
    BackpressureRejected { priority: Priority, utilization: f64 },

    /// Malformed method or params.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The provider answered with a JSON-RPC error object.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    /// The client is draining and no longer admits calls.
    #[error("client is shutting down")]
    ShuttingDown,
}

impl RpcError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Network { .. } => "network",
            RpcError::RateLimited { .. } => "rate_limited",
            RpcError::CircuitOpen { .. } => "circuit_open",
            RpcError::BackpressureRejected { .. } => "backpressure",
            RpcError::Validation(_) => "validation",
            RpcError::Upstream { .. } => "upstream",
            RpcError::ShuttingDown => "shutting_down",
        }
    }
}

/// Failure of one physical exchange with one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    /// HTTP 429 or a rate-limit JSON-RPC code.
    #[error("provider signalled rate limiting")]
    RateLimited,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether this outcome should count against the endpoint's breaker.
    ///
    /// Provider throttling drains the bucket instead.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, TransportError::RateLimited)
    }
}
