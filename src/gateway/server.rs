//! # HTTP Server Shell
//!
//! Thin axum application around the pipeline: the management endpoints
//! (`/metrics`, `/health`, `/health/ready`) plus a fallback that hands every
//! other request to [`pipeline::handle`]. Panics in request handling are
//! caught at this boundary and surfaced as a JSON 500.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{pipeline, GatewayState};
use crate::core::error::{GatewayError, GatewayResult};

/// Build the axum application for the gateway.
pub fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/health", get(health_endpoint))
        .route("/health/ready", get(readiness_endpoint))
        .fallback(proxy_endpoint)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(panic_response))
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

/// Serve the application until the shutdown future resolves.
pub async fn serve(
    state: GatewayState,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> GatewayResult<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| GatewayError::internal(format!("listener address unavailable: {e}")))?;
    info!(%addr, "gateway listening");
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| GatewayError::internal(format!("server error: {e}")))
}

async fn proxy_endpoint(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    pipeline::handle(&state, request, peer.ip()).await
}

async fn metrics_endpoint(State(state): State<GatewayState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.snapshot_text(),
    )
        .into_response()
}

async fn health_endpoint() -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Ready once the config manager has loaded and the shared store answers.
async fn readiness_endpoint(State(state): State<GatewayState>) -> Response {
    if !state.config.is_initialized() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": "configuration not loaded" })),
        )
            .into_response();
    }
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": e.to_string() })),
        )
            .into_response(),
    }
}

/// Convert a caught panic into the gateway's JSON 500 envelope.
fn panic_response(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal Server Error",
            "reason": "unexpected gateway fault",
        })),
    )
        .into_response()
}
