//! API route definitions.

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::Extensions;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use super::state::AppState;
use crate::control;

pub fn api_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = chrono::Utc::now() - state.started_at;
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptime_sec": uptime.num_seconds(),
            "strategy": state.control.test.strategy,
        }
    }))
}

/// Upgrade to the control channel.
pub async fn control_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    extensions: Extensions,
) -> Response {
    // Absent when the router is driven without connect info (tests).
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    ws.on_upgrade(move |socket| control::serve_socket(socket, state.control, peer))
}
