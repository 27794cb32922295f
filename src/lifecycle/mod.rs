//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → termination_signal() resolves
//!
//! Shutdown (shutdown.rs):
//!     drain() → close admission → critical phase → normal phase → DrainReport
//! ```
//!
//! # Design Decisions
//! - Critical work gets the longer soft timeout; normal work drains after it
//! - A hard deadline bounds the whole drain
//! - The report maps to the process exit code

pub mod shutdown;
pub mod signals;

pub use shutdown::{
    join_within, DrainOutcome, DrainReport, OperationClass, OperationGuard, ShutdownCoordinator,
};
pub use signals::termination_signal;
