//! Cache manager.
//!
//! # Responsibilities
//! - Serve fresh entries from HOT, then MAIN
//! - Expire entries passively on access and actively on a sweep interval
//! - Promote hot MAIN entries, demote and evict by least recent access
//! - Single-flight misses through the batch coalescer

use dashmap::DashMap;
use futures_util::future::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::batch::{BatchCoalescer, InFlight};
use crate::cache::entry::{CacheEntry, CacheTier};
use crate::config::CacheConfig;
use crate::observability::metrics;
use crate::types::{CallResult, RequestKey, RpcRequest};

/// Share of MAIN capacity evicted at once when it fills up.
const EVICTION_FRACTION: usize = 20;

#[derive(Debug, Default)]
struct Counters {
    hot_hits: AtomicU64,
    main_hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
    fetches: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub hot_entries: usize,
    pub main_entries: usize,
    pub hot_hits: u64,
    pub main_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    /// Calls with a zero TTL that skipped the cache.
    pub bypassed: u64,
    /// Upstream fetches started by misses.
    pub fetches: u64,
    pub in_flight_fetches: usize,
    pub promotions: u64,
    pub demotions: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct CacheInner {
    config: CacheConfig,
    hot: DashMap<RequestKey, CacheEntry>,
    main: DashMap<RequestKey, CacheEntry>,
    fetches: Arc<InFlight>,
    coalescer: BatchCoalescer,
    /// Logical clock for recency.
    tick: AtomicU64,
    counters: Counters,
}

#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl CacheManager {
    pub fn new(coalescer: BatchCoalescer, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                config,
                hot: DashMap::new(),
                main: DashMap::new(),
                fetches: Arc::new(InFlight::new()),
                coalescer,
                tick: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serve `request` from cache or fetch it, storing successes for `ttl`.
    ///
    /// A zero `ttl` bypasses the cache entirely.
    pub async fn get(&self, request: RpcRequest, ttl: Duration, timeout: Duration) -> CallResult {
        let inner = &self.inner;
        if ttl.is_zero() {
            inner.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            return inner.coalescer.call(request, timeout).await;
        }

        let key = request.key();
        if let Some(value) = inner.lookup(&key) {
            return Ok(value);
        }

        let owner = inner.clone();
        let fetch_key = key.clone();
        let (shared, joined) = inner.fetches.run(key, move || {
            owner.fetch(fetch_key, request, ttl, timeout).boxed()
        });
        if joined {
            tracing::trace!("Joined in-flight cache fill");
        }
        shared.await
    }

    /// Drop the entry for this request from both tiers.
    pub fn invalidate(&self, request: &RpcRequest) -> bool {
        let key = request.key();
        let hot = self.inner.hot.remove(&key).is_some();
        let main = self.inner.main.remove(&key).is_some();
        hot || main
    }

    pub fn clear(&self) {
        self.inner.hot.clear();
        self.inner.main.clear();
        tracing::info!("Cache cleared");
    }

    /// Remove expired entries from both tiers, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for map in [&self.inner.hot, &self.inner.main] {
            map.retain(|_, entry| {
                let keep = !entry.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        self.inner
            .counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_ms` until shutdown.
    pub fn spawn_sweeper(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = self.clone();
        let interval = Duration::from_millis(self.inner.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Cache sweeper starting");
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Cache sweeper received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        })
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let c = &self.inner.counters;
        let hot_hits = c.hot_hits.load(Ordering::Relaxed);
        let main_hits = c.main_hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let lookups = hot_hits + main_hits + misses;
        CacheSnapshot {
            hot_entries: self.inner.hot.len(),
            main_entries: self.inner.main.len(),
            hot_hits,
            main_hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hot_hits + main_hits) as f64 / lookups as f64
            },
            bypassed: c.bypassed.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            in_flight_fetches: self.inner.fetches.len(),
            promotions: c.promotions.load(Ordering::Relaxed),
            demotions: c.demotions.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup(&self, key: &RequestKey) -> Option<Value> {
        let now = Instant::now();
        let tick = self.next_tick();

        let hot = self.hot.get(key).map(|entry| {
            (!entry.is_expired(now)).then(|| {
                entry.touch(tick);
                entry.value.clone()
            })
        });
        match hot {
            Some(Some(value)) => {
                self.counters.hot_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("hot");
                return Some(value);
            }
            Some(None) => self.expire(&self.hot, key, now),
            None => {}
        }

        let main = self.main.get(key).map(|entry| {
            (!entry.is_expired(now)).then(|| {
                let hits = entry.touch(tick);
                let promote = hits >= self.config.promote_after_hits
                    && entry.size_bytes <= self.config.hot_max_value_bytes
                    && self.config.hot_capacity > 0;
                (entry.value.clone(), promote)
            })
        });
        match main {
            Some(Some((value, promote))) => {
                self.counters.main_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("main");
                if promote {
                    self.promote(key);
                }
                return Some(value);
            }
            Some(None) => self.expire(&self.main, key, now),
            None => {}
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup("miss");
        None
    }

    /// Fresh value without touching statistics.
    fn peek(&self, key: &RequestKey) -> Option<Value> {
        let now = Instant::now();
        [&self.hot, &self.main].into_iter().find_map(|map| {
            map.get(key)
                .filter(|entry| !entry.is_expired(now))
                .map(|entry| entry.value.clone())
        })
    }

    async fn fetch(
        self: Arc<Self>,
        key: RequestKey,
        request: RpcRequest,
        ttl: Duration,
        timeout: Duration,
    ) -> CallResult {
        // Another fill may have landed between the miss and taking the flight.
        if let Some(value) = self.peek(&key) {
            return Ok(value);
        }
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let result = self.coalescer.call(request, timeout).await;
        if let Ok(value) = &result {
            self.store(key, value.clone(), ttl);
        }
        result
    }

    fn store(&self, key: RequestKey, value: Value, ttl: Duration) {
        let entry = CacheEntry::new(value, ttl, self.next_tick());
        self.hot.remove(&key);
        self.insert_main(key, entry);
    }

    fn expire(&self, map: &DashMap<RequestKey, CacheEntry>, key: &RequestKey, now: Instant) {
        if map.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn insert_main(&self, key: RequestKey, entry: CacheEntry) {
        if !self.main.contains_key(&key) && self.main.len() >= self.config.main_capacity {
            self.evict_lru();
        }
        self.main.insert(key, entry);
    }

    fn promote(&self, key: &RequestKey) {
        let Some((key, mut entry)) = self.main.remove(key) else {
            return;
        };
        while self.hot.len() >= self.config.hot_capacity {
            if !self.demote_lru() {
                break;
            }
        }
        entry.tier = CacheTier::Hot;
        self.hot.insert(key, entry);
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
    }

    fn demote_lru(&self) -> bool {
        let victim = self
            .hot
            .iter()
            .min_by_key(|e| e.last_access())
            .map(|e| e.key().clone());
        let Some(victim) = victim else {
            return false;
        };
        if let Some((key, mut entry)) = self.hot.remove(&victim) {
            entry.tier = CacheTier::Main;
            self.insert_main(key, entry);
            self.counters.demotions.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn evict_lru(&self) {
        let mut candidates: Vec<(u64, RequestKey)> = self
            .main
            .iter()
            .map(|e| (e.last_access(), e.key().clone()))
            .collect();
        let n = (self.config.main_capacity / EVICTION_FRACTION)
            .max(1)
            .min(candidates.len());
        if n == 0 {
            return;
        }
        if n < candidates.len() {
            candidates.select_nth_unstable_by_key(n - 1, |(tick, _)| *tick);
        }
        let mut evicted = 0u64;
        for (_, key) in candidates.into_iter().take(n) {
            if self.main.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        tracing::debug!(evicted, "Evicted least recently used cache entries");
    }
}
