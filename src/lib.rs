//! Resilient multi-endpoint JSON-RPC access layer.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──▶ client::call ──▶ admission ──▶ cache (HOT/MAIN, single-flight)
//!                                                  │ miss
//!                                                  ▼
//!                                           batch coalescer (dedup, windows)
//!                                                  │
//!                                                  ▼
//!                                   dispatch ──▶ load_balancer (scored selector)
//!                                      │              │
//!                                      │              ▼
//!                                      │     endpoint: breaker + bucket + cap
//!                                      ▼
//!                                  transport (JSON-RPC over HTTP)
//!
//!   cross-cutting: config, events, lifecycle (drain), observability, admin
//! ```

pub mod admin;
pub mod admission;
pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;
pub mod transport;
pub mod types;

pub use client::{AccessStats, ClientError, RpcClient};
pub use config::AccessConfig;
pub use error::{RpcError, TransportError};
pub use events::AccessEvent;
pub use lifecycle::{DrainOutcome, DrainReport, OperationClass};
pub use types::{CallOptions, CallResult, Priority, RpcRequest};
