//! End-to-end behaviour over the HTTP transport against mock JSON-RPC servers.

use common::{start_jsonrpc_backend, Reply};
use futures_util::future::join_all;
use resilient_rpc::config::{AccessConfig, EndpointConfig, MethodBatchConfig, RateLimitConfig};
use resilient_rpc::{CallOptions, RpcClient, RpcError};
use serde_json::json;

mod common;

fn http_config(endpoints: &[(&str, String, u32)]) -> AccessConfig {
    let mut config = AccessConfig::default();
    config.endpoints = endpoints
        .iter()
        .map(|(name, url, weight)| EndpointConfig::new(*name, url.clone(), *weight))
        .collect();
    config
}

#[tokio::test]
async fn test_server_error_fails_over() {
    let bad = start_jsonrpc_backend("bad", Reply::Status(500)).await;
    let good = start_jsonrpc_backend("good", Reply::Results).await;
    let client = RpcClient::new(http_config(&[
        ("bad", bad.url(), 10),
        ("good", good.url(), 1),
    ]))
    .unwrap();

    let value = client
        .call("eth_blockNumber", json!([]), CallOptions::default().no_cache())
        .await
        .unwrap();

    assert_eq!(value["server"], "good");
    assert_eq!(value["method"], "eth_blockNumber");
    assert_eq!(bad.posts(), 1);
    assert_eq!(good.posts(), 1);
    assert_eq!(client.stats().dispatch.failovers, 1);
}

#[tokio::test]
async fn test_upstream_throttle_drains_bucket() {
    let throttled = start_jsonrpc_backend("throttled", Reply::ErrorCode(-32005)).await;
    let spare = start_jsonrpc_backend("spare", Reply::Results).await;
    let mut config = http_config(&[
        ("throttled", throttled.url(), 10),
        ("spare", spare.url(), 1),
    ]);
    config.endpoints[0].rate_limit = Some(RateLimitConfig {
        capacity: 10.0,
        refill_per_sec: 0.001,
    });
    let client = RpcClient::new(config).unwrap();

    let value = client
        .call("eth_getLogs", json!([{}]), CallOptions::default().no_cache())
        .await
        .unwrap();
    assert_eq!(value["server"], "spare");

    let snapshot = client
        .endpoints()
        .into_iter()
        .find(|e| e.id == "throttled")
        .unwrap();
    assert!(snapshot.rate_limit.tokens < 1.0, "{snapshot:?}");
    assert_eq!(snapshot.circuit.failures, 0);

    // With no budget left, the throttled endpoint is skipped outright.
    client
        .call("eth_getLogs", json!([{"fromBlock": "0x1"}]), CallOptions::default().no_cache())
        .await
        .unwrap();
    assert_eq!(throttled.posts(), 1);
}

#[tokio::test]
async fn test_upstream_error_is_surfaced_without_failover() {
    let node = start_jsonrpc_backend("node", Reply::ErrorCode(-32000)).await;
    let other = start_jsonrpc_backend("other", Reply::Results).await;
    let client = RpcClient::new(http_config(&[
        ("node", node.url(), 10),
        ("other", other.url(), 1),
    ]))
    .unwrap();

    let err = client
        .call("eth_call", json!([{}]), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Upstream { code: -32000, .. }), "{err}");
    assert_eq!(other.posts(), 0);
}

#[tokio::test]
async fn test_window_batches_into_one_post() {
    let node = start_jsonrpc_backend("node", Reply::Results).await;
    let mut config = http_config(&[("node", node.url(), 1)]);
    config.batch.bypass_when_idle = false;
    config.batch.methods.insert(
        "eth_getBalance".to_string(),
        MethodBatchConfig {
            window_ms: 20,
            max_batch_size: 50,
        },
    );
    let client = RpcClient::new(config).unwrap();

    let addresses: Vec<String> = (0..5).map(|i| format!("0x{i:040x}")).collect();
    let calls = addresses.iter().map(|address| {
        client.call(
            "eth_getBalance",
            json!([address, "latest"]),
            CallOptions::default().no_cache(),
        )
    });
    let results = join_all(calls).await;

    for (address, result) in addresses.iter().zip(results) {
        let value = result.unwrap();
        assert_eq!(value["params"][0], address.as_str());
    }
    assert_eq!(node.posts(), 1);
    assert_eq!(*node.state.batch_sizes.lock().unwrap(), vec![5]);
    assert_eq!(client.stats().batch.batches_flushed, 1);
}
