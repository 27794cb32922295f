//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms via the metrics facade)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Whatever recorder the embedding application installs
//! ```

pub mod logging;
pub mod metrics;
