//! Metrics collection.
//!
//! # Metrics
//! - `rpc_calls_total` (counter): logical calls by method, outcome
//! - `rpc_admission_rejected_total` (counter): shed calls by priority
//! - `rpc_cache_lookups_total` (counter): lookups by result (hot, main, miss)
//! - `rpc_batch_flushes_total` (counter): physical batches by method
//! - `rpc_batch_size` (histogram): logical calls per flushed batch
//! - `rpc_endpoint_attempts_total` (counter): attempts by endpoint, outcome
//! - `rpc_endpoint_latency_seconds` (histogram): attempt latency by endpoint
//! - `rpc_endpoint_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `rpc_admission_in_flight` (gauge): admitted, unfinished calls
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use crate::resilience::CircuitState;
use crate::types::Priority;

pub fn record_call(method: &str, outcome: &'static str) {
    counter!("rpc_calls_total", "method" => method.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_admission_rejected(priority: Priority) {
    counter!("rpc_admission_rejected_total", "priority" => priority.as_str()).increment(1);
}

pub fn record_admission_in_flight(in_flight: usize) {
    gauge!("rpc_admission_in_flight").set(in_flight as f64);
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("rpc_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_batch_flush(method: &str, size: usize) {
    counter!("rpc_batch_flushes_total", "method" => method.to_string()).increment(1);
    histogram!("rpc_batch_size", "method" => method.to_string()).record(size as f64);
}

pub fn record_attempt(endpoint: &str, outcome: &'static str, latency: Duration) {
    counter!("rpc_endpoint_attempts_total", "endpoint" => endpoint.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("rpc_endpoint_latency_seconds", "endpoint" => endpoint.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_circuit_state(endpoint: &str, state: CircuitState) {
    gauge!("rpc_endpoint_circuit_state", "endpoint" => endpoint.to_string()).set(state.as_gauge());
}
