//! Request types shared across the access layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RpcError;

/// Longest accepted method name.
pub const MAX_METHOD_LEN: usize = 128;

/// Outcome of one logical JSON-RPC call.
pub type CallResult = Result<Value, RpcError>;

/// Caller-assigned urgency, used by admission control and shutdown draining.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Normal, Priority::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Critical => "critical",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub priority: Priority,
    /// Overrides the configured TTL. `Some(Duration::ZERO)` skips the cache.
    pub cache_ttl: Option<Duration>,
    /// Overrides the configured per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn critical() -> Self {
        Self {
            priority: Priority::Critical,
            ..Default::default()
        }
    }

    pub fn low() -> Self {
        Self {
            priority: Priority::Low,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn no_cache(self) -> Self {
        self.with_cache_ttl(Duration::ZERO)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A validated JSON-RPC call. Absent params are normalised to `[]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub method: Arc<str>,
    pub params: Value,
}

impl RpcRequest {
    /// Build a request, checking the method name and params shape.
    pub fn new(method: &str, params: Value) -> Result<Self, RpcError> {
        if method.is_empty() {
            return Err(RpcError::Validation("method must not be empty".into()));
        }
        if method.len() > MAX_METHOD_LEN {
            return Err(RpcError::Validation(format!(
                "method name exceeds {MAX_METHOD_LEN} bytes"
            )));
        }
        if method.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RpcError::Validation(format!(
                "method {method:?} contains whitespace"
            )));
        }
        let params = match params {
            Value::Null => Value::Array(Vec::new()),
            p @ (Value::Array(_) | Value::Object(_)) => p,
            other => {
                return Err(RpcError::Validation(format!(
                    "params must be an array or object, got {}",
                    type_name(&other)
                )))
            }
        };
        Ok(Self {
            method: Arc::from(method),
            params,
        })
    }

    /// Identity used for deduplication and caching.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.method.clone(), self.params.clone())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Method plus params, hashed independently of object key order.
///
/// Equality compares the full values, so a hash collision never merges two requests.
#[derive(Debug, Clone)]
pub struct RequestKey {
    hash: u64,
    method: Arc<str>,
    params: Arc<Value>,
}

impl RequestKey {
    pub fn new(method: Arc<str>, params: Value) -> Self {
        let mut hasher = DefaultHasher::new();
        method.hash(&mut hasher);
        hash_json(&params, &mut hasher);
        Self {
            hash: hasher.finish(),
            method,
            params: Arc::new(params),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Value {
        &self.params
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.method == other.method && self.params == other.params
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Feed a JSON value into a hasher with a type tag per node and sorted object keys.
fn hash_json<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_json(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(state);
                hash_json(&map[key], state);
            }
        }
    }
}
