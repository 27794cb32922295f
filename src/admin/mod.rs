//! Read-only admin API.
//!
//! # Routes
//! ```text
//! GET /admin/status     → version, health, drain flag
//! GET /admin/health     → 200 healthy / 503 unhealthy
//! GET /admin/stats      → full AccessStats
//! GET /admin/endpoints  → per-endpoint snapshots
//! ```
//! Every route requires `Authorization: Bearer <api_key>`.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::client::RpcClient;
use crate::config::AdminConfig;

#[derive(Clone)]
pub struct AdminState {
    pub client: RpcClient,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(client: RpcClient, api_key: &str) -> Router {
    let state = AdminState {
        client,
        api_key: Arc::from(api_key),
    };
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/health", get(get_health))
        .route("/admin/stats", get(get_stats))
        .route("/admin/endpoints", get(get_endpoints))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until the shutdown signal fires.
pub async fn serve(
    client: RpcClient,
    config: &AdminConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");

    let app = setup_admin_router(client, &config.api_key);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
