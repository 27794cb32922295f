//! Single-flight execution keyed by request identity.
//!
//! The first caller for a key spawns the work; callers arriving while it runs
//! share the same outcome. The spawned task removes the entry itself once the
//! work completes, so a cancelled caller never strands an entry and a caller
//! arriving after completion starts fresh.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RpcError;
use crate::types::{CallResult, RequestKey};

pub type SharedCall = Shared<BoxFuture<'static, CallResult>>;

struct Call {
    id: u64,
    shared: SharedCall,
}

#[derive(Default)]
pub struct InFlight {
    calls: DashMap<RequestKey, Call>,
    next_id: AtomicU64,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running call for `key`, or start `work` as a new one.
    ///
    /// Returns the shared outcome and whether an existing call was joined.
    /// `work` runs under the map's shard lock and must only build the future.
    pub fn run<F>(self: &Arc<Self>, key: RequestKey, work: F) -> (SharedCall, bool)
    where
        F: FnOnce() -> BoxFuture<'static, CallResult>,
    {
        match self.calls.entry(key) {
            Entry::Occupied(e) => (e.get().shared.clone(), true),
            Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let key = e.key().clone();
                let fut = work();
                let map = self.clone();
                let handle = tokio::spawn(async move {
                    let result = fut.await;
                    map.calls.remove_if(&key, |_, call| call.id == id);
                    result
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(RpcError::Network {
                            attempted: Vec::new(),
                            cause: format!("call task failed: {e}"),
                        })
                    })
                }
                .boxed()
                .shared();
                e.insert(Call {
                    id,
                    shared: shared.clone(),
                });
                (shared, false)
            }
        }
    }

    /// Keys currently being worked on.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
