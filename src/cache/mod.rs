//! Two-tier response cache.
//!
//! # Tiers
//! - MAIN: every fetched response lands here, LRU-evicted in batches at capacity
//! - HOT: small, frequently read entries promoted from MAIN; overflow demotes
//!   the least recently used HOT entry back to MAIN
//!
//! Misses for the same key share one fetch through the batch coalescer.

pub mod entry;
pub mod manager;

pub use entry::{CacheEntry, CacheTier};
pub use manager::{CacheManager, CacheSnapshot};
