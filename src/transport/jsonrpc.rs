//! JSON-RPC 2.0 wire encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, TransportError};
use crate::types::{CallResult, RpcRequest};

/// Provider error codes that mean "slow down" rather than "broken".
pub const RATE_LIMIT_CODES: [i64; 2] = [-32005, 429];

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: i64,
    #[serde(default)]
    message: String,
}

pub fn is_rate_limit_code(code: i64) -> bool {
    RATE_LIMIT_CODES.contains(&code)
}

/// Encode requests with consecutive ids starting at `first_id`.
///
/// A single request is sent as a bare object, more than one as an array.
pub fn encode(requests: &[RpcRequest], first_id: u64) -> Result<Vec<u8>, TransportError> {
    let wire: Vec<WireRequest<'_>> = requests
        .iter()
        .zip(first_id..)
        .map(|(r, id)| WireRequest {
            jsonrpc: "2.0",
            id,
            method: &r.method,
            params: &r.params,
        })
        .collect();
    let encoded = match wire.as_slice() {
        [single] => serde_json::to_vec(single),
        many => serde_json::to_vec(many),
    };
    encoded.map_err(|e| TransportError::Decode(e.to_string()))
}

/// Decode a response body into per-request results, matched by id.
pub fn decode(
    body: &[u8],
    first_id: u64,
    count: usize,
) -> Result<Vec<CallResult>, TransportError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| TransportError::Decode(e.to_string()))?;
    let responses: Vec<WireResponse> = match value {
        Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|r| vec![r]),
    }
    .map_err(|e| TransportError::Decode(e.to_string()))?;

    let mut slots: Vec<Option<CallResult>> = vec![None; count];
    for response in responses {
        if let Some(err) = &response.error {
            if is_rate_limit_code(err.code) {
                return Err(TransportError::RateLimited);
            }
        }
        let index = response
            .id
            .as_u64()
            .and_then(|id| id.checked_sub(first_id))
            .and_then(|i| usize::try_from(i).ok())
            .filter(|&i| i < count);
        let outcome = match response.error {
            Some(err) => Err(RpcError::Upstream {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        match index {
            Some(i) => slots[i] = Some(outcome),
            // An error without a usable id applies to the whole request.
            None if count == 1 || outcome.is_err() => {
                if let Err(e) = outcome {
                    return Ok(vec![Err(e); count]);
                }
                slots[0] = Some(outcome);
            }
            None => {
                return Err(TransportError::Decode(format!(
                    "unexpected response id {}",
                    response.id
                )))
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| {
                TransportError::Decode(format!("missing response for id {}", first_id + i as u64))
            })
        })
        .collect()
}
