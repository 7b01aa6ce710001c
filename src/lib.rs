#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ltbroker library: the reverse-tunnel broker behind the `ltbroker` binary.
//!
//! - `tunnel`: connection pools, per-tunnel proxy, registry
//! - `router`: Host → tunnel dispatch and the auth gate
//! - `routes`: tunnel creation, landing page, status API
//! - `auth`: Basic auth parsing, constant-time comparison, password generation
//! - `ids`: tunnel id validation and random id generation
//! - `config`: configuration loading
//!
//! ## API surface
//!
//! | Method | Path                       | Description                              |
//! |--------|----------------------------|------------------------------------------|
//! | GET    | `/?new`                    | Create a tunnel with a random id         |
//! | GET    | `/`                        | Landing page                             |
//! | any    | `/{name}`                  | Create a named tunnel                    |
//! | GET    | `/api/status`              | Tunnel count and process memory          |
//! | GET    | `/api/tunnels/{id}/status` | Connected sockets of one tunnel          |
//!
//! Requests whose `Host` is `<id>.<domain>` never reach these routes; they are
//! proxied to tunnel `<id>` (plain requests and WebSocket upgrades alike).

pub mod auth;
pub mod config;
pub mod error;
pub mod ids;
pub mod router;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod util;

use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use tower_http::trace::TraceLayer;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use state::AppState;
pub use tunnel::{ClientManager, TunnelClient};

/// Build the public HTTP application.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// creation responses can report the requester's address.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::tunnels::root))
        .route("/api/status", get(routes::status::status))
        .route("/api/tunnels/{id}/status", get(routes::status::tunnel_status))
        .route("/{name}", any(routes::tunnels::named))
        .fallback(routes::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), router::dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
