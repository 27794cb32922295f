//! The public call surface.
//!
//! # Data Flow
//! ```text
//! call(method, params, options)
//!     → RpcRequest::new (validation)
//!     → AdmissionController::try_admit (priority thresholds)
//!     → ShutdownCoordinator::register (drain tracking)
//!     → CacheManager::get (HOT/MAIN, single-flight on miss)
//!     → BatchCoalescer::call (dedup + per-method batching)
//!     → Dispatcher::execute (selector ranking, failover or race)
//!     → RpcTransport::send
//! ```
//!
//! Consumers only see `call`, `stats`, `is_healthy` and the event stream.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::batch::{BatchCoalescer, BatchSnapshot};
use crate::cache::{CacheManager, CacheSnapshot};
use crate::config::{validate_config, AccessConfig, ConfigError};
use crate::dispatch::{DispatchSnapshot, Dispatcher};
use crate::error::RpcError;
use crate::events::{AccessEvent, EventBus};
use crate::lifecycle::{DrainReport, OperationClass, OperationGuard, ShutdownCoordinator};
use crate::load_balancer::{EndpointRegistry, EndpointSnapshot, ScoredSelector};
use crate::observability::metrics;
use crate::transport::{HttpTransport, RpcTransport};
use crate::types::{CallOptions, CallResult, RpcRequest};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Point-in-time view of every layer.
#[derive(Debug, Clone, Serialize)]
pub struct AccessStats {
    pub healthy: bool,
    pub draining: bool,
    pub endpoints: Vec<EndpointSnapshot>,
    pub dispatch: DispatchSnapshot,
    pub batch: BatchSnapshot,
    pub cache: CacheSnapshot,
    pub admission: AdmissionSnapshot,
    /// Events lost because a subscriber's buffer was full.
    pub events_dropped: u64,
}

struct ClientInner {
    config: AccessConfig,
    events: Arc<EventBus>,
    registry: Arc<EndpointRegistry>,
    selector: Arc<ScoredSelector>,
    dispatcher: Arc<Dispatcher>,
    coalescer: BatchCoalescer,
    cache: CacheManager,
    admission: AdmissionController,
    shutdown: ShutdownCoordinator,
}

/// Resilient multi-endpoint JSON-RPC client.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Build a client that talks to the configured endpoints over HTTP.
    pub fn new(config: AccessConfig) -> Result<Self, ClientError> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(config, transport)?)
    }

    pub fn with_transport(
        config: AccessConfig,
        transport: Arc<dyn RpcTransport>,
    ) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(EndpointRegistry::new(&config, events.clone())?);
        let selector = Arc::new(ScoredSelector::new(config.selector.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            selector.clone(),
            transport,
            config.dispatch.clone(),
        ));
        let coalescer = BatchCoalescer::new(dispatcher.clone(), config.batch.clone());
        let cache = CacheManager::new(coalescer.clone(), config.cache.clone());
        let admission = AdmissionController::new(config.admission.clone());
        let shutdown = ShutdownCoordinator::new(config.shutdown.clone(), events.clone());

        tracing::info!(
            endpoints = registry.len(),
            total_weight = registry.total_weight(),
            mode = ?config.dispatch.mode,
            "RPC client initialized"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                events,
                registry,
                selector,
                dispatcher,
                coalescer,
                cache,
                admission,
                shutdown,
            }),
        })
    }

    /// Execute one logical JSON-RPC call.
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> CallResult {
        let request = match RpcRequest::new(method, params) {
            Ok(request) => request,
            Err(e) => {
                metrics::record_call("invalid", e.kind());
                return Err(e);
            }
        };
        let method = request.method.clone();
        let result = self.execute(request, &options).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::record_call(&method, outcome);
        result
    }

    async fn execute(&self, request: RpcRequest, options: &CallOptions) -> CallResult {
        let inner = &self.inner;
        let _permit = match inner.admission.try_admit(options.priority) {
            Ok(permit) => permit,
            Err(e) => {
                if let RpcError::BackpressureRejected {
                    priority,
                    utilization,
                } = &e
                {
                    inner.events.publish(AccessEvent::AdmissionRejected {
                        priority: *priority,
                        utilization: *utilization,
                    });
                }
                return Err(e);
            }
        };
        let _operation = inner
            .shutdown
            .register(options.priority.into(), request.method.to_string());

        let ttl = options
            .cache_ttl
            .unwrap_or_else(|| inner.config.cache.ttl_for(&request.method));
        let timeout = options
            .timeout
            .unwrap_or_else(|| inner.config.dispatch.request_timeout());
        inner.cache.get(request, ttl, timeout).await
    }

    pub fn stats(&self) -> AccessStats {
        let inner = &self.inner;
        AccessStats {
            healthy: self.is_healthy(),
            draining: inner.shutdown.is_draining(),
            endpoints: inner.registry.snapshots(),
            dispatch: inner.dispatcher.snapshot(),
            batch: inner.coalescer.snapshot(),
            cache: inner.cache.snapshot(),
            admission: inner.admission.snapshot(),
            events_dropped: inner.events.dropped(),
        }
    }

    /// True while at least one endpoint can take traffic and calls are admitted.
    pub fn is_healthy(&self) -> bool {
        self.inner.registry.healthy_count() > 0 && self.inner.admission.is_accepting()
    }

    pub fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AccessEvent> {
        self.inner.events.subscribe(capacity)
    }

    /// Track caller-side work so the drain waits for it.
    pub fn register_operation(
        &self,
        class: OperationClass,
        label: impl Into<String>,
    ) -> OperationGuard {
        self.inner.shutdown.register(class, label)
    }

    /// Shutdown signal for caller-owned background tasks.
    pub fn shutdown_signal(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Start the cache sweeper. It stops when the drain begins.
    pub fn spawn_background(&self) -> JoinHandle<()> {
        self.inner
            .cache
            .spawn_sweeper(self.inner.shutdown.subscribe())
    }

    /// Apply the hot-reloadable part of a new configuration.
    pub fn apply_tuning(&self, config: &AccessConfig) {
        self.inner.selector.update(config.selector.clone());
    }

    pub fn invalidate(&self, method: &str, params: Value) -> Result<bool, RpcError> {
        let request = RpcRequest::new(method, params)?;
        Ok(self.inner.cache.invalidate(&request))
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Stop admitting calls and wait for tracked work.
    pub async fn shutdown(&self) -> DrainReport {
        self.inner.shutdown.drain(&self.inner.admission).await
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.dispatch.request_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchMode;
    use crate::dispatch::dispatcher::tests::access_config;
    use crate::transport::mock::{echo, Behavior, MockTransport};
    use crate::types::Priority;
    use serde_json::json;

    fn client(config: AccessConfig) -> (RpcClient, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let client = RpcClient::with_transport(config, transport.clone()).unwrap();
        (client, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_then_cache_hit() {
        let (client, transport) = client(access_config(&[("a", 1)]));

        let first = client
            .call("eth_chainId", Value::Null, CallOptions::default())
            .await
            .unwrap();
        let second = client
            .call("eth_chainId", json!([]), CallOptions::default())
            .await
            .unwrap();

        let expected = echo("a", &RpcRequest::new("eth_chainId", json!([])).unwrap());
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(transport.call_count(), 1);

        let stats = client.stats();
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.cache.main_hits + stats.cache.hot_hits, 1);
        assert!(stats.healthy);
    }

    #[tokio::test]
    async fn test_invalid_method_never_reaches_transport() {
        let (client, transport) = client(access_config(&[("a", 1)]));
        let err = client
            .call("", json!([]), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(client.stats().admission.in_flight, 0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let transport = Arc::new(MockTransport::new());
        let result = RpcClient::with_transport(AccessConfig::default(), transport);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_critical_call() {
        let (client, transport) = client(access_config(&[("a", 1)]));
        transport.set("a", Behavior::Respond(Duration::from_millis(1_500)));

        let caller = client.clone();
        let pending = tokio::spawn(async move {
            caller
                .call("eth_sendRawTransaction", json!(["0x01"]), CallOptions::critical())
                .await
        });
        while client.stats().admission.in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let report = client.shutdown().await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.elapsed, Duration::from_millis(1_500));
        assert!(pending.await.unwrap().is_ok());

        assert!(!client.is_healthy());
        let err = client
            .call("eth_chainId", json!([]), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_rejection_publishes_event() {
        let mut config = access_config(&[("a", 1)]);
        config.admission.max_queue_size = 1;
        let (client, transport) = client(config);
        transport.set("a", Behavior::Hang);
        let mut events = client.subscribe(8);

        let caller = client.clone();
        let _hung = tokio::spawn(async move {
            caller
                .call("eth_call", json!([{}]), CallOptions::default())
                .await
        });
        while client.stats().admission.in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let err = client
            .call("eth_getLogs", json!([{}]), CallOptions::low())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::BackpressureRejected { .. }));
        assert_eq!(
            events.recv().await,
            Some(AccessEvent::AdmissionRejected {
                priority: Priority::Low,
                utilization: 1.0,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_cache_option_always_fetches() {
        let (client, transport) = client(access_config(&[("a", 1)]));
        for _ in 0..3 {
            client
                .call("eth_blockNumber", json!([]), CallOptions::default().no_cache())
                .await
                .unwrap();
        }
        assert_eq!(transport.call_count(), 3);
        assert_eq!(client.stats().cache.bypassed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let (client, transport) = client(access_config(&[("a", 1)]));
        let options = CallOptions::default().with_cache_ttl(Duration::from_secs(60));
        client.call("eth_chainId", json!([]), options.clone()).await.unwrap();
        assert!(client.invalidate("eth_chainId", json!([])).unwrap());
        client.call("eth_chainId", json!([]), options).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_apply_tuning_swaps_selector_weights() {
        let (client, _) = client(access_config(&[("a", 1)]));
        let mut tuned = client.config().clone();
        tuned.selector.target_latency_ms = 50;
        tuned.dispatch.mode = DispatchMode::Race;
        client.apply_tuning(&tuned);
        assert_eq!(client.inner.selector.config().target_latency_ms, 50);
        assert_eq!(client.config().dispatch.mode, DispatchMode::Sequential);
    }
}
