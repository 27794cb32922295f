//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AccessConfig (validated, immutable)
//!     → handed to RpcClient, which splits it across subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → RpcClient::apply_tuning swaps the selector weights
//! ```
//!
//! # Design Decisions
//! - Endpoint topology is fixed at startup; only scoring weights hot-reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AccessConfig, AdmissionConfig, AdminConfig, BatchConfig, CacheConfig, CircuitBreakerConfig,
    DispatchConfig, DispatchMode, EndpointConfig, LogFormat, MethodBatchConfig,
    ObservabilityConfig, RateLimitConfig, ScoringWeights, SelectorConfig, ShutdownConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
