//! Management API route handlers.
//!
//! These only see requests whose `Host` does not name a tunnel; tunnel traffic
//! is diverted earlier by [`crate::router::dispatch`].

pub mod status;
pub mod tunnels;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Fallback for unmatched management paths.
pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"})))
}
