//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the access layer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for the RPC access layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// Ordered upstream endpoint list.
    pub endpoints: Vec<EndpointConfig>,

    /// Per-endpoint failure isolation.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default token bucket applied to endpoints without an override.
    pub rate_limit: RateLimitConfig,

    /// Endpoint scoring.
    pub selector: SelectorConfig,

    /// Attempt timeouts, failover and racing.
    pub dispatch: DispatchConfig,

    /// Request coalescing.
    pub batch: BatchConfig,

    /// Response cache.
    pub cache: CacheConfig,

    /// Admission control.
    pub admission: AdmissionConfig,

    /// Drain-on-shutdown timeouts.
    pub shutdown: ShutdownConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,

    /// Read-only admin API.
    pub admin: AdminConfig,
}

/// Upstream endpoint definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Unique endpoint identifier used in logs and stats.
    pub name: String,

    /// JSON-RPC URL (e.g., "https://eth-mainnet.example/v2/key").
    pub url: String,

    /// Static weight for load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum concurrent in-flight requests to this endpoint.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Optional token bucket override for this provider.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_weight() -> u32 {
    1
}

fn default_max_concurrency() -> usize {
    50
}

impl EndpointConfig {
    /// Convenience constructor used by tests and embedders.
    pub fn new(name: impl Into<String>, url: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight,
            max_concurrency: default_max_concurrency(),
            rate_limit: None,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `window_ms` that open the circuit.
    pub failure_threshold: u32,

    /// Tracking window for the failure counter in milliseconds.
    pub window_ms: u64,

    /// Time spent open before probes are allowed, in milliseconds.
    pub cooldown_ms: u64,

    /// Concurrent probe calls admitted while half-open.
    pub half_open_trial_limit: u32,

    /// Probe successes needed to close the circuit again.
    pub consecutive_successes_required: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 30_000,
            cooldown_ms: 10_000,
            half_open_trial_limit: 1,
            consecutive_successes_required: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size).
    pub capacity: f64,

    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_sec: 50.0,
        }
    }
}

/// Scoring coefficients for endpoint selection.
///
/// Each factor is normalised to `[0, 1]` before being multiplied by its weight.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    /// Free concurrency fraction, squared.
    pub capacity: f64,

    /// Target latency divided by observed latency, capped at 1.
    pub latency: f64,

    /// Remaining token fraction.
    pub rate_limit: f64,

    /// Historical success ratio.
    pub success: f64,

    /// Static weight share, applied through a smooth weighted rotation credit.
    pub priority: f64,

    /// Flat bonus for closed circuits over half-open ones.
    pub breaker_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capacity: 1.0,
            latency: 1.0,
            rate_limit: 0.5,
            success: 1.0,
            priority: 2.0,
            breaker_bonus: 0.25,
        }
    }
}

/// Endpoint selector configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    /// Factor weights.
    pub weights: ScoringWeights,

    /// Latency at or below which an endpoint gets the full latency score.
    pub target_latency_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            target_latency_ms: 250,
        }
    }
}

/// How the dispatcher spreads a physical request over candidates.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Try candidates one after another.
    #[default]
    Sequential,
    /// Race the top candidates, then fall back to sequential failover.
    Race,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-attempt timeout when the caller gives none, in milliseconds.
    pub request_timeout_ms: u64,

    /// Maximum physical sends per logical dispatch.
    pub max_attempts: u32,

    /// Dispatch mode.
    pub mode: DispatchMode,

    /// Number of concurrent attempts in race mode.
    pub race_fanout: usize,

    /// Shared deadline for a race, in milliseconds.
    pub race_deadline_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_attempts: 3,
            mode: DispatchMode::Sequential,
            race_fanout: 2,
            race_deadline_ms: 2_000,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn race_deadline(&self) -> Duration {
        Duration::from_millis(self.race_deadline_ms)
    }
}

/// Batching rules for one method.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct MethodBatchConfig {
    /// Collection window in milliseconds.
    #[serde(default = "default_batch_window_ms")]
    pub window_ms: u64,

    /// Size at which a pending batch flushes immediately.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_batch_window_ms() -> u64 {
    20
}

fn default_max_batch_size() -> usize {
    50
}

impl Default for MethodBatchConfig {
    fn default() -> Self {
        Self {
            window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl MethodBatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Batch coalescer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Methods eligible for batching, keyed by method name.
    pub methods: HashMap<String, MethodBatchConfig>,

    /// Largest JSON-RPC array the providers accept in one HTTP request.
    pub provider_batch_limit: usize,

    /// Dispatch a call immediately when nothing else for its method is pending or in flight.
    pub bypass_when_idle: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            provider_batch_limit: 100,
            bypass_when_idle: true,
        }
    }
}

/// Two-tier cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for methods without an explicit entry, in milliseconds. Zero disables caching.
    pub default_ttl_ms: u64,

    /// Per-method TTL overrides in milliseconds.
    pub method_ttls_ms: HashMap<String, u64>,

    /// Maximum entries in the MAIN tier.
    pub main_capacity: usize,

    /// Maximum entries in the HOT tier.
    pub hot_capacity: usize,

    /// Access count at which a MAIN entry becomes eligible for HOT.
    pub promote_after_hits: u64,

    /// Largest serialized value size, in bytes, allowed into HOT.
    pub hot_max_value_bytes: usize,

    /// Expired-entry sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 1_000,
            method_ttls_ms: HashMap::new(),
            main_capacity: 10_000,
            hot_capacity: 512,
            promote_after_hits: 3,
            hot_max_value_bytes: 4 * 1024,
            sweep_interval_ms: 5_000,
        }
    }
}

impl CacheConfig {
    /// TTL configured for a method, falling back to the default.
    pub fn ttl_for(&self, method: &str) -> Duration {
        let ms = self
            .method_ttls_ms
            .get(method)
            .copied()
            .unwrap_or(self.default_ttl_ms);
        Duration::from_millis(ms)
    }
}

/// Admission control thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum admitted, unfinished calls.
    pub max_queue_size: usize,

    /// Utilization at which `low` priority is rejected.
    pub warning_threshold: f64,

    /// Utilization at which only `critical` priority is admitted.
    pub critical_threshold: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            warning_threshold: 0.7,
            critical_threshold: 0.9,
        }
    }
}

/// Drain timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for critical operations, in milliseconds.
    pub soft_timeout_ms: u64,

    /// Time allowed for normal operations after the critical phase, in milliseconds.
    pub normal_timeout_ms: u64,

    /// Absolute limit for the whole drain, in milliseconds.
    pub hard_timeout_ms: u64,

    /// Interval between drain progress log lines, in milliseconds.
    pub progress_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            soft_timeout_ms: 30_000,
            normal_timeout_ms: 10_000,
            hard_timeout_ms: 45_000,
            progress_interval_ms: 1_000,
        }
    }
}

impl ShutdownConfig {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn normal_timeout(&self) -> Duration {
        Duration::from_millis(self.normal_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
