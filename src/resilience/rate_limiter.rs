//! Token bucket rate limiting per endpoint.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket that refills continuously.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub utilization: f64,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
        state
    }

    /// Take `n` tokens if they are all available.
    pub fn try_consume(&self, n: u32) -> bool {
        let n = f64::from(n);
        let mut state = self.refilled();
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        self.refilled().tokens
    }

    /// Remaining fraction of capacity in `[0, 1]`.
    pub fn headroom(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        (self.available() / self.capacity).clamp(0.0, 1.0)
    }

    pub fn utilization(&self) -> f64 {
        1.0 - self.headroom()
    }

    /// Empty the bucket after the provider signalled throttling.
    pub fn drain(&self) {
        self.refilled().tokens = 0.0;
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let tokens = self.available();
        BucketSnapshot {
            capacity: self.capacity,
            tokens,
            refill_per_sec: self.refill_per_sec,
            utilization: if self.capacity > 0.0 {
                1.0 - (tokens / self.capacity).clamp(0.0, 1.0)
            } else {
                1.0
            },
        }
    }
}
