use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AdminState;
use crate::client::AccessStats;
use crate::load_balancer::EndpointSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub healthy: bool,
    pub draining: bool,
    pub endpoints: usize,
}

#[derive(Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let stats = state.client.stats();
    let status = if stats.draining {
        "draining"
    } else if stats.healthy {
        "operational"
    } else {
        "degraded"
    };
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        healthy: stats.healthy,
        draining: stats.draining,
        endpoints: stats.endpoints.len(),
    })
}

pub async fn get_health(State(state): State<AdminState>) -> (StatusCode, Json<HealthStatus>) {
    let healthy = state.client.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthStatus { healthy }))
}

pub async fn get_stats(State(state): State<AdminState>) -> Json<AccessStats> {
    Json(state.client.stats())
}

pub async fn get_endpoints(State(state): State<AdminState>) -> Json<Vec<EndpointSnapshot>> {
    Json(state.client.endpoints())
}

#[cfg(test)]
mod tests {
    use crate::admin::setup_admin_router;
    use crate::client::RpcClient;
    use crate::dispatch::dispatcher::tests::access_config;
    use crate::transport::mock::MockTransport;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn setup() -> (RpcClient, Router) {
        let client = RpcClient::with_transport(
            access_config(&[("a", 2), ("b", 1)]),
            Arc::new(MockTransport::new()),
        )
        .unwrap();
        let router = setup_admin_router(client.clone(), "secret");
        (client, router)
    }

    fn get(path: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_bearer_key() {
        let (_, router) = setup();
        let missing = router.clone().oneshot(get("/admin/status", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let wrong = router.oneshot(get("/admin/status", Some("nope"))).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_endpoints_listing() {
        let (_, router) = setup();
        let response = router
            .oneshot(get("/admin/endpoints", Some("secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_health_turns_unavailable_after_drain() {
        let (client, router) = setup();
        let ok = router
            .clone()
            .oneshot(get("/admin/health", Some("secret")))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        client.shutdown().await;
        let down = router
            .clone()
            .oneshot(get("/admin/health", Some("secret")))
            .await
            .unwrap();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);

        let status = json(router.oneshot(get("/admin/status", Some("secret"))).await.unwrap()).await;
        assert_eq!(status["status"], "draining");
    }

    #[tokio::test]
    async fn test_stats_body_has_every_layer() {
        let (_, router) = setup();
        let body = json(
            router
                .oneshot(get("/admin/stats", Some("secret")))
                .await
                .unwrap(),
        )
        .await;
        for section in ["endpoints", "dispatch", "batch", "cache", "admission"] {
            assert!(body.get(section).is_some(), "missing {section}");
        }
    }
}
