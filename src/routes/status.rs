//! Broker and per-tunnel status endpoints.
//!
//! | Field              | Source                                      |
//! |--------------------|---------------------------------------------|
//! | `tunnels`          | live entries in the tunnel registry         |
//! | `mem`              | `/proc/self/status` (`VmRSS`, `VmSize`, `VmPeak`) |
//! | `connected_sockets`| idle plus lent-out sockets in one pool      |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::state::AppState;
use crate::util::process_memory;

/// `GET /api/status`: tunnel count and process memory.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.manager.stats().await;
    Json(json!({
        "tunnels": stats.tunnels,
        "mem": process_memory(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// `GET /api/tunnels/{id}/status`: socket count of one tunnel.
pub async fn tunnel_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_client(&id).await {
        Some(client) => Json(json!({
            "connected_sockets": client.stats().connected_sockets,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Tunnel not found"})),
        )
            .into_response(),
    }
}
