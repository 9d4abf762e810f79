//! Agent HTTP surface: the config API plus readiness, metrics and a ring
//! debug view.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterNode, NodeState, Peer};
use crate::observability::MetricsRegistry;
use crate::store::api::ConfigApi;

#[derive(Clone)]
pub struct HttpState {
    pub node: Arc<ClusterNode>,
    pub registry: MetricsRegistry,
}

#[derive(Serialize)]
struct RingResponse {
    state: NodeState,
    self_addr: String,
    peers: Vec<Peer>,
}

/// Every route the agent serves.
pub fn router(api: ConfigApi, state: HttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ops = Router::new()
        .route("/-/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/ring", get(ring_handler))
        .with_state(state);

    Router::new()
        .merge(api.router())
        .merge(ops)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Serve `app` on `addr` until `shutdown` fires.
pub async fn run_http(addr: SocketAddr, app: Router, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP server failed");
    }
}

async fn ready_handler(State(state): State<HttpState>) -> impl IntoResponse {
    if state.node.is_ready() {
        (StatusCode::OK, "Ready.\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready.\n")
    }
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.registry.render(),
    )
        .into_response()
}

async fn ring_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let membership = state.node.membership();
    Json(RingResponse {
        state: state.node.state(),
        self_addr: membership.self_addr().to_string(),
        peers: membership.all_healthy().unwrap_or_default(),
    })
}
