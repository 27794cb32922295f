//! Batch coalescer.
//!
//! Calls to configured methods are collected per method for a short window
//! and sent as JSON-RPC arrays. When nothing for a method is pending or in
//! flight the call goes out immediately on its own, so an idle client pays no
//! batching latency.

use dashmap::DashMap;
use futures_util::future::{join_all, FutureExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::batch::inflight::InFlight;
use crate::config::{BatchConfig, MethodBatchConfig};
use crate::dispatch::Dispatcher;
use crate::error::RpcError;
use crate::observability::metrics;
use crate::types::{CallResult, RpcRequest};

struct Slot {
    request: RpcRequest,
    tx: oneshot::Sender<CallResult>,
}

struct PendingBatch {
    id: u64,
    timeout: Duration,
    slots: Vec<Slot>,
}

#[derive(Default)]
struct MethodQueue {
    pending: Option<PendingBatch>,
    /// Physical dispatches for this method not yet resolved.
    in_flight: usize,
}

enum Enqueued {
    Bypass(RpcRequest),
    Waiting(oneshot::Receiver<CallResult>),
}

#[derive(Debug, Default)]
struct Counters {
    logical: AtomicU64,
    deduplicated: AtomicU64,
    flushes: AtomicU64,
    batched_calls: AtomicU64,
    physical: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub logical_calls: u64,
    /// Calls that joined an identical call already in flight.
    pub deduplicated: u64,
    pub batches_flushed: u64,
    /// Calls that travelled in a physical request with at least one other call.
    pub batched_calls: u64,
    pub physical_requests: u64,
    /// Share of logical calls that did not need their own physical request.
    pub efficiency: f64,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    config: BatchConfig,
    /// Physical chunk size: the provider limit, capped by the smallest bucket.
    chunk_limit: usize,
    queues: DashMap<Arc<str>, MethodQueue>,
    in_flight: Arc<InFlight>,
    next_batch: AtomicU64,
    counters: Counters,
}

/// Deduplicating, batching front of the dispatcher.
#[derive(Clone)]
pub struct BatchCoalescer {
    inner: Arc<Inner>,
}

impl BatchCoalescer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: BatchConfig) -> Self {
        let bucket_limit = dispatcher.registry().max_request_units();
        let chunk_limit = config.provider_batch_limit.min(bucket_limit).max(1);
        if chunk_limit < config.provider_batch_limit {
            tracing::info!(
                provider_batch_limit = config.provider_batch_limit,
                chunk_limit,
                "Batch chunks capped by endpoint rate limit capacity"
            );
        }
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                config,
                chunk_limit,
                queues: DashMap::new(),
                in_flight: Arc::new(InFlight::new()),
                next_batch: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Resolve one logical call.
    pub async fn call(&self, request: RpcRequest, timeout: Duration) -> CallResult {
        self.inner.counters.logical.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let (shared, joined) = self
            .inner
            .in_flight
            .run(request.key(), move || inner.submit(request, timeout).boxed());
        if joined {
            self.inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
        }
        shared.await
    }

    pub fn pending_keys(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let c = &self.inner.counters;
        let logical = c.logical.load(Ordering::Relaxed);
        let physical = c.physical.load(Ordering::Relaxed);
        BatchSnapshot {
            logical_calls: logical,
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            batches_flushed: c.flushes.load(Ordering::Relaxed),
            batched_calls: c.batched_calls.load(Ordering::Relaxed),
            physical_requests: physical,
            efficiency: if logical == 0 {
                0.0
            } else {
                (1.0 - physical as f64 / logical as f64).max(0.0)
            },
        }
    }
}

impl Inner {
    async fn submit(self: Arc<Self>, request: RpcRequest, timeout: Duration) -> CallResult {
        let Some(rules) = self.config.methods.get(&*request.method).copied() else {
            return self.dispatch_single(request, timeout).await;
        };
        let method = request.method.clone();
        match self.enqueue(request, timeout, rules) {
            Enqueued::Bypass(request) => {
                let result = self.dispatch_single(request, timeout).await;
                self.finish(&method);
                result
            }
            Enqueued::Waiting(rx) => rx.await.unwrap_or_else(|_| {
                Err(RpcError::Network {
                    attempted: Vec::new(),
                    cause: "batch dropped before completion".into(),
                })
            }),
        }
    }

    async fn dispatch_single(&self, request: RpcRequest, timeout: Duration) -> CallResult {
        self.counters.physical.fetch_add(1, Ordering::Relaxed);
        let results = self
            .dispatcher
            .execute(std::slice::from_ref(&request), timeout)
            .await?;
        results.into_iter().next().unwrap_or_else(|| {
            Err(RpcError::Network {
                attempted: Vec::new(),
                cause: "empty response".into(),
            })
        })
    }

    fn enqueue(
        self: &Arc<Self>,
        request: RpcRequest,
        timeout: Duration,
        rules: MethodBatchConfig,
    ) -> Enqueued {
        let method = request.method.clone();
        let mut queue = self.queues.entry(method.clone()).or_default();
        if self.config.bypass_when_idle && queue.pending.is_none() && queue.in_flight == 0 {
            queue.in_flight += 1;
            return Enqueued::Bypass(request);
        }

        let (tx, rx) = oneshot::channel();
        let slot = Slot { request, tx };
        let full = match queue.pending.as_mut() {
            Some(batch) => {
                batch.slots.push(slot);
                batch.slots.len() >= rules.max_batch_size
            }
            None => {
                let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
                queue.pending = Some(PendingBatch {
                    id,
                    timeout,
                    slots: vec![slot],
                });
                let inner = self.clone();
                let m = method.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(rules.window()).await;
                    inner.flush_expired(m, id).await;
                });
                rules.max_batch_size <= 1
            }
        };

        if full {
            let batch = queue.pending.take();
            queue.in_flight += 1;
            drop(queue);
            if let Some(batch) = batch {
                let inner = self.clone();
                tokio::spawn(async move { inner.flush(method, batch).await });
            }
        }
        Enqueued::Waiting(rx)
    }

    /// Window timer: flush only if the batch it was armed for is still pending.
    async fn flush_expired(self: Arc<Self>, method: Arc<str>, id: u64) {
        let batch = {
            let Some(mut queue) = self.queues.get_mut(&method) else {
                return;
            };
            if queue.pending.as_ref().map(|b| b.id) != Some(id) {
                return;
            }
            queue.in_flight += 1;
            queue.pending.take()
        };
        if let Some(batch) = batch {
            self.flush(method, batch).await;
        }
    }

    async fn flush(self: Arc<Self>, method: Arc<str>, batch: PendingBatch) {
        let size = batch.slots.len();
        let timeout = batch.timeout;
        let limit = self.chunk_limit;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::record_batch_flush(&method, size);

        let mut chunks: Vec<Vec<Slot>> = Vec::with_capacity(size.div_ceil(limit));
        let mut slots = batch.slots.into_iter().peekable();
        while slots.peek().is_some() {
            chunks.push(slots.by_ref().take(limit).collect());
        }
        tracing::debug!(%method, size, chunks = chunks.len(), "Flushing batch");

        self.counters
            .physical
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        if size >= 2 {
            self.counters
                .batched_calls
                .fetch_add(size as u64, Ordering::Relaxed);
        }

        let outcomes = join_all(chunks.iter().map(|chunk| {
            let requests: Vec<RpcRequest> = chunk.iter().map(|s| s.request.clone()).collect();
            let dispatcher = &self.dispatcher;
            async move { dispatcher.execute(&requests, timeout).await }
        }))
        .await;

        for (chunk, outcome) in chunks.into_iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    for (slot, result) in chunk.into_iter().zip(results) {
                        let _ = slot.tx.send(result);
                    }
                }
                Err(err) => {
                    tracing::debug!(%method, error = %err, "Batch chunk failed");
                    for slot in chunk {
                        let _ = slot.tx.send(Err(err.clone()));
                    }
                }
            }
        }
        self.finish(&method);
    }

    fn finish(&self, method: &Arc<str>) {
        if let Some(mut queue) = self.queues.get_mut(method) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
        }
        self.queues
            .remove_if(method, |_, q| q.pending.is_none() && q.in_flight == 0);
    }
}
