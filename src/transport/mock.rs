//! Scripted transport for unit tests.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::TransportError;
use crate::load_balancer::endpoint::Endpoint;
use crate::transport::RpcTransport;
use crate::types::{CallResult, RpcRequest};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Respond(Duration),
    Fail(TransportError),
    Hang,
}

#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<(String, Vec<RpcRequest>)>>,
    poisoned: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, endpoint: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), behavior);
    }

    /// Fail any physical call that carries these params.
    pub(crate) fn poison(&self, params: Value) {
        self.poisoned.lock().unwrap().push(params);
    }

    /// Endpoint and requests of every physical send, in arrival order.
    pub(crate) fn calls(&self) -> Vec<(String, Vec<RpcRequest>)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Response the mock gives for a request served by `endpoint`.
pub(crate) fn echo(endpoint: &str, request: &RpcRequest) -> Value {
    json!({"endpoint": endpoint, "method": &*request.method, "params": request.params})
}

impl RpcTransport for MockTransport {
    fn send<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        requests: &'a [RpcRequest],
    ) -> BoxFuture<'a, Result<Vec<CallResult>, TransportError>> {
        Box::pin(async move {
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(&*endpoint.id)
                .cloned()
                .unwrap_or(Behavior::Respond(Duration::ZERO));
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.id.to_string(), requests.to_vec()));
            let poisoned = {
                let poisoned = self.poisoned.lock().unwrap();
                requests.iter().any(|r| poisoned.contains(&r.params))
            };
            let behavior = if poisoned {
                Behavior::Fail(TransportError::Status(500))
            } else {
                behavior
            };

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = match behavior {
                Behavior::Respond(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(requests.iter().map(|r| Ok(echo(&endpoint.id, r))).collect())
                }
                Behavior::Fail(err) => Err(err),
                Behavior::Hang => std::future::pending().await,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}
