//! Health and metrics HTTP endpoints

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use k8s_openapi::api::core::v1::Node;
use prometheus::{Encoder, TextEncoder};

use machina_common::crd::NodeClass;

use crate::cache::ObjectCache;

/// State for the health endpoint
#[derive(Clone)]
pub struct HealthState {
    /// Node cache whose sync gates readiness
    pub nodes: Arc<dyn ObjectCache<Node>>,
    /// Class cache whose sync gates readiness
    pub classes: Arc<dyn ObjectCache<NodeClass>>,
}

/// Router for `/healthz`
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Router for `/metrics`
pub fn metrics_router(registry: prometheus::Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry)
}

/// Bind and serve a router until the process exits
pub async fn serve(addr: SocketAddr, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app).await
}

/// Ready only once both caches have completed their initial list
async fn healthz(State(state): State<HealthState>) -> Response {
    if state.nodes.has_synced() && state.classes.has_synced() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced").into_response()
    }
}

async fn metrics(State(registry): State<prometheus::Registry>) -> Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buf,
    )
        .into_response()
}
