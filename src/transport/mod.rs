//! Physical exchange with providers.
//!
//! The dispatcher only sees [`RpcTransport`]; production uses [`HttpTransport`],
//! tests script their own.

pub mod http;
pub mod jsonrpc;

use futures_util::future::BoxFuture;

use crate::error::TransportError;
use crate::load_balancer::endpoint::Endpoint;
use crate::types::{CallResult, RpcRequest};

pub use http::HttpTransport;

/// Sends one physical request (single call or array batch) to one endpoint.
///
/// On success the returned vector has one entry per request, in request order.
/// Per-call JSON-RPC errors are entries, not a transport failure.
pub trait RpcTransport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        requests: &'a [RpcRequest],
    ) -> BoxFuture<'a, Result<Vec<CallResult>, TransportError>>;
}

#[cfg(test)]
pub(crate) mod mock;
