//! Host-based dispatch of public traffic to tunnels.
//!
//! Every request passes through [`dispatch`] before axum routing applies:
//!
//! 1. No `Host` header → `400`.
//! 2. Host names no tunnel → fall through to the management API (upgrades get
//!    `400 Invalid hostname` instead; the API has no upgrade endpoints).
//! 3. Tunnel id not registered → `503` with `X-Localtunnel-Status`.
//! 4. Auth gate (Basic) → `401` on failure.
//! 5. Forward to the tunnel as a plain request or an upgrade.

use std::net::IpAddr;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::auth::authorize;
use crate::state::AppState;

/// Resolves a `Host` header to a tunnel id.
#[derive(Debug, Clone, Default)]
pub struct HostResolver {
    domain: Option<String>,
}

impl HostResolver {
    /// `domain` is the base domain tunnels live under. Without one, any host
    /// of three or more labels (or `<id>.localhost`) yields its leftmost label.
    pub fn new(domain: Option<&str>) -> Self {
        Self {
            domain: domain
                .map(normalize_host)
                .filter(|d| !d.is_empty()),
        }
    }

    pub fn tunnel_id(&self, host: &str) -> Option<String> {
        let host = normalize_host(host);
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let label = match &self.domain {
            Some(domain) => {
                let prefix = host.strip_suffix(domain.as_str())?.strip_suffix('.')?;
                prefix.split('.').next()?
            }
            None => {
                let labels: Vec<&str> = host.split('.').collect();
                let is_localhost = labels.last() == Some(&"localhost");
                if labels.len() >= 3 || (is_localhost && labels.len() == 2) {
                    labels[0]
                } else {
                    return None;
                }
            }
        };

        (!label.is_empty()).then(|| label.to_string())
    }
}

/// Strip any port, lowercase, and drop a trailing root dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal: keep the address between the brackets.
        host.trim_start_matches('[')
            .split(']')
            .next()
            .unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or_default()
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// `Upgrade` present and `Connection` carries the `upgrade` token.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    if !headers.contains_key(header::UPGRADE) {
        return false;
    }
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn tunnel_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::HeaderName::from_static("x-localtunnel-status"), "Tunnel Unavailable"),
        ],
        "503 - Tunnel Unavailable",
    )
        .into_response()
}

/// Middleware routing tunnel-host traffic away from the management API.
pub async fn dispatch(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let upgrade = is_upgrade_request(req.headers());

    let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        let body = if upgrade {
            "400 - Host header is required"
        } else {
            "Host header is required"
        };
        return plain(StatusCode::BAD_REQUEST, body);
    };

    let Some(id) = state.resolver.tunnel_id(&host) else {
        if upgrade {
            return plain(StatusCode::BAD_REQUEST, "400 - Invalid hostname");
        }
        return next.run(req).await;
    };

    let Some(client) = state.manager.get_client(&id).await else {
        debug!(id = %id, host = %host, "request for unknown tunnel");
        return tunnel_unavailable();
    };

    if let Err(response) = authorize(req.headers(), &client) {
        debug!(id = %id, "tunnel auth rejected");
        return response;
    }

    if upgrade {
        client.handle_upgrade(req).await
    } else {
        client.handle_request(req).await
    }
}
