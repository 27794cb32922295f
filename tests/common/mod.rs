//! Shared utilities for integration tests.
#![allow(dead_code)]

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures_util::future::BoxFuture;
use resilient_rpc::config::{AccessConfig, EndpointConfig, RateLimitConfig};
use resilient_rpc::load_balancer::endpoint::Endpoint;
use resilient_rpc::transport::RpcTransport;
use resilient_rpc::{CallResult, RpcRequest, TransportError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Config with one endpoint per `(name, weight)`, generous limits and no batching.
pub fn config(endpoints: &[(&str, u32)]) -> AccessConfig {
    let mut config = AccessConfig::default();
    config.endpoints = endpoints
        .iter()
        .map(|(name, weight)| EndpointConfig::new(*name, format!("http://{name}.test"), *weight))
        .collect();
    config.rate_limit = RateLimitConfig {
        capacity: 1_000_000.0,
        refill_per_sec: 1_000_000.0,
    };
    config
}

/// In-process transport with per-method latency and per-endpoint counters.
#[derive(Default)]
pub struct ScriptedTransport {
    latency: Mutex<HashMap<String, Duration>>,
    failing: Mutex<Vec<String>>,
    served: Mutex<HashMap<String, usize>>,
    /// Per endpoint: sends in progress and the most seen at once.
    active: Mutex<HashMap<String, (usize, usize)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay(&self, method: &str, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(method.to_string(), latency);
    }

    pub fn fail_endpoint(&self, endpoint: &str) {
        self.failing.lock().unwrap().push(endpoint.to_string());
    }

    /// Requests successfully served by `endpoint`.
    pub fn served(&self, endpoint: &str) -> usize {
        self.served
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Most sends `endpoint` ever had in progress at the same time.
    pub fn peak_in_flight(&self, endpoint: &str) -> usize {
        self.active
            .lock()
            .unwrap()
            .get(endpoint)
            .map_or(0, |(_, peak)| *peak)
    }

    async fn serve(
        &self,
        endpoint: &Endpoint,
        requests: &[RpcRequest],
    ) -> Result<Vec<CallResult>, TransportError> {
        let latency = requests
            .iter()
            .filter_map(|r| self.latency.lock().unwrap().get(&*r.method).copied())
            .max()
            .unwrap_or(Duration::ZERO);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().unwrap().iter().any(|e| **e == *endpoint.id) {
            return Err(TransportError::Status(503));
        }
        *self
            .served
            .lock()
            .unwrap()
            .entry(endpoint.id.to_string())
            .or_default() += requests.len();
        Ok(requests
            .iter()
            .map(|r| Ok(json!({"endpoint": &*endpoint.id, "params": r.params})))
            .collect())
    }

    fn enter(&self, endpoint: &str) {
        let mut active = self.active.lock().unwrap();
        let (current, peak) = active.entry(endpoint.to_string()).or_default();
        *current += 1;
        *peak = (*peak).max(*current);
    }

    fn leave(&self, endpoint: &str) {
        if let Some((current, _)) = self.active.lock().unwrap().get_mut(endpoint) {
            *current -= 1;
        }
    }
}

impl RpcTransport for ScriptedTransport {
    fn send<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        requests: &'a [RpcRequest],
    ) -> BoxFuture<'a, Result<Vec<CallResult>, TransportError>> {
        Box::pin(async move {
            self.enter(&endpoint.id);
            let result = self.serve(endpoint, requests).await;
            self.leave(&endpoint.id);
            result
        })
    }
}

/// How a mock JSON-RPC server answers.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Results,
    Status(u16),
    ErrorCode(i64),
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

pub struct MockState {
    pub name: String,
    pub reply: Mutex<Reply>,
    pub posts: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl MockServer {
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn posts(&self) -> usize {
        self.state.posts.load(Ordering::SeqCst)
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.state.reply.lock().unwrap() = reply;
    }
}

/// Start an axum JSON-RPC backend on an ephemeral port.
pub async fn start_jsonrpc_backend(name: &str, reply: Reply) -> MockServer {
    let state = Arc::new(MockState {
        name: name.to_string(),
        reply: Mutex::new(reply),
        posts: AtomicUsize::new(0),
        batch_sizes: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/", post(handle))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockServer { addr, state }
}

async fn handle(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.posts.fetch_add(1, Ordering::SeqCst);
    let reply = *state.reply.lock().unwrap();
    if let Reply::Status(code) = reply {
        return (
            StatusCode::from_u16(code).unwrap(),
            Json(json!({"error": "scripted"})),
        );
    }

    let answer = |req: &Value| match reply {
        Reply::ErrorCode(code) => json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": code, "message": "scripted error"},
        }),
        _ => json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": {"server": state.name, "method": req["method"], "params": req["params"]},
        }),
    };

    let response = match &body {
        Value::Array(requests) => {
            state.batch_sizes.lock().unwrap().push(requests.len());
            // Reverse so clients must match responses by id.
            Value::Array(requests.iter().rev().map(answer).collect())
        }
        single => {
            state.batch_sizes.lock().unwrap().push(1);
            answer(single)
        }
    };
    (StatusCode::OK, Json(response))
}
