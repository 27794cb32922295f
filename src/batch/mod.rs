//! Request batching subsystem.
//!
//! # Data Flow
//! ```text
//! Logical call
//!     → inflight.rs (identical call running? share its outcome)
//!     → coalescer.rs (batchable method? queue into the pending batch)
//!         - flush on max_batch_size or window expiry
//!         - split into provider-sized chunks, dispatched in parallel
//!         - responses routed back by position
//!     → Dispatcher
//! ```

pub mod coalescer;
pub mod inflight;

pub use coalescer::{BatchCoalescer, BatchSnapshot};
pub use inflight::{InFlight, SharedCall};
