//! Cache entry bookkeeping.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Hot,
    Main,
}

/// A cached response with its expiry and access statistics.
///
/// Access bookkeeping is atomic so hits only need a shared map reference.
#[derive(Debug)]
pub struct CacheEntry {
    pub value: Value,
    pub tier: CacheTier,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    /// Serialized size, used for the HOT admission limit.
    pub size_bytes: usize,
    access_count: AtomicU64,
    last_access: AtomicU64,
}

impl CacheEntry {
    pub fn new(value: Value, ttl: Duration, tick: u64) -> Self {
        let now = Instant::now();
        let size_bytes = serde_json::to_vec(&value).map_or(usize::MAX, |v| v.len());
        Self {
            value,
            tier: CacheTier::Main,
            inserted_at: now,
            expires_at: now + ttl,
            size_bytes,
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(tick),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Record a hit at logical time `tick`, returning the new access count.
    pub fn touch(&self, tick: u64) -> u64 {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_touch() {
        let entry = CacheEntry::new(json!("0x10"), Duration::from_millis(100), 1);
        assert_eq!(entry.size_bytes, 6);
        assert!(!entry.is_expired(Instant::now()));
        assert_eq!(entry.touch(5), 1);
        assert_eq!(entry.touch(3), 2);
        assert_eq!(entry.last_access(), 5);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(entry.is_expired(Instant::now()));
    }
}
