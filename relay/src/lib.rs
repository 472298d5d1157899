//! PollTunnel Relay
//!
//! Server side of the HTTP tunnel: holds long-poll requests, forwards
//! client payloads to the target in sequence order and answers held
//! requests with target data.

pub mod config;
pub mod filter;
pub mod matcher;
pub mod server;
pub mod target;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use filter::{tunnel_filter, TunnelFilter};

/// Build the relay router: the tunnel filter in front of `/health` and a
/// 404 fallback for everything else.
pub fn app(filter: TunnelFilter) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(middleware::from_fn_with_state(filter.clone(), tunnel_filter))
        .with_state(filter)
}

async fn health_handler(State(filter): State<TunnelFilter>) -> impl IntoResponse {
    let session = filter.server().session_state().await.map(|s| s.as_str());
    Json(serde_json::json!({
        "status": "ok",
        "session": session,
    }))
}
