//! HTTP transport backed by reqwest.

use futures_util::future::BoxFuture;
use reqwest::{header, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TransportError;
use crate::load_balancer::endpoint::Endpoint;
use crate::transport::{jsonrpc, RpcTransport};
use crate::types::{CallResult, RpcRequest};

/// JSON-RPC over HTTP POST with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    next_id: std::sync::Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("resilient-rpc/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        requests: &[RpcRequest],
    ) -> Result<Vec<CallResult>, TransportError> {
        let first_id = self
            .next_id
            .fetch_add(requests.len() as u64, Ordering::Relaxed);
        let body = jsonrpc::encode(requests, first_id)?;

        let response = self
            .client
            .post(endpoint.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited);
        }
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(map_reqwest)?;
        jsonrpc::decode(&bytes, first_id, requests.len())
    }
}

impl RpcTransport for HttpTransport {
    fn send<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        requests: &'a [RpcRequest],
    ) -> BoxFuture<'a, Result<Vec<CallResult>, TransportError>> {
        Box::pin(self.exchange(endpoint, requests))
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() || e.is_body() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}
