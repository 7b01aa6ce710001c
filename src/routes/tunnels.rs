//! Tunnel creation and the landing page.
//!
//! - `GET /?new[&username=..][&password=..]` creates a tunnel with a random id.
//! - `GET /` without `new` serves the landing page.
//! - `/{name}` (any method, exactly one path segment) creates a named tunnel.
//!
//! A `username` turns on Basic auth for the tunnel; when no `password` is
//! given one is generated. Both are echoed back in the response and embedded
//! in the returned URL.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::ids::{is_valid_subdomain, random_id, INVALID_SUBDOMAIN_MESSAGE};
use crate::state::AppState;
use crate::tunnel::{AuthOptions, TunnelInfo};

/// Random ids are retried this many times on collision.
const RANDOM_ID_ATTEMPTS: usize = 5;

/// Query parameters accepted by both creation endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct CreateParams {
    /// Present (with any value, including empty) to request a new tunnel.
    pub new: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CreateParams {
    fn auth(&self) -> AuthOptions {
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
        AuthOptions {
            username: non_empty(&self.username),
            password: non_empty(&self.password),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatedTunnel {
    #[serde(flatten)]
    info: TunnelInfo,
    url: String,
}

/// `GET /`: create a random tunnel when `new` is present, else the landing page.
pub async fn root(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
    request: Request,
) -> Response {
    let host = request_host(request.headers());
    if params.new.is_none() {
        return Html(landing_page(state.scheme(), &host)).into_response();
    }

    let endpoint = endpoint_ip(&request);
    for _ in 0..RANDOM_ID_ATTEMPTS {
        let id = random_id();
        debug!(id = %id, "new random tunnel request");
        match state.manager.new_client(&id, params.auth()).await {
            Ok(info) => return created(&state, info, &host, &endpoint),
            Err(TunnelError::IdInUse(_)) => {}
            Err(e) => return creation_failed(e),
        }
    }

    warn!(attempts = RANDOM_ID_ATTEMPTS, "no free random tunnel id");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"message": "Could not allocate a tunnel id"})),
    )
        .into_response()
}

/// `/{name}`: create a tunnel with a requested id.
pub async fn named(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<CreateParams>,
    request: Request,
) -> Response {
    if !is_valid_subdomain(&name) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"message": INVALID_SUBDOMAIN_MESSAGE})),
        )
            .into_response();
    }

    debug!(id = %name, "new named tunnel request");
    let host = request_host(request.headers());
    let endpoint = endpoint_ip(&request);
    match state.manager.new_client(&name, params.auth()).await {
        Ok(info) => created(&state, info, &host, &endpoint),
        Err(e) => creation_failed(e),
    }
}

fn created(state: &AppState, info: TunnelInfo, host: &str, endpoint: &str) -> Response {
    let base = state.config.server.domain.as_deref().unwrap_or(host);
    let url = tunnel_url(state.scheme(), &info, base);
    let id = info.id.clone();

    let mut response = Json(CreatedTunnel { info, url }).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&id) {
        headers.insert("x-localtunnel-subdomain", value);
    }
    if let Ok(value) = HeaderValue::from_str(endpoint) {
        headers.insert("x-localtunnel-endpoint", value);
    }
    response
}

fn creation_failed(err: TunnelError) -> Response {
    match err {
        TunnelError::IdInUse(id) => (
            StatusCode::CONFLICT,
            Json(json!({"message": format!("Subdomain {id} is already in use")})),
        )
            .into_response(),
        TunnelError::Agent(e) => {
            warn!(error = %e, "failed to create tunnel");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"message": "Failed to create tunnel"})),
            )
                .into_response()
        }
    }
}

/// `scheme://[username:password@]id.base`
pub fn tunnel_url(scheme: &str, info: &TunnelInfo, base: &str) -> String {
    match (&info.username, &info.password) {
        (Some(username), Some(password)) => {
            format!("{scheme}://{username}:{password}@{}.{base}", info.id)
        }
        _ => format!("{scheme}://{}.{base}", info.id),
    }
}

fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// First `X-Forwarded-For` entry, else the peer address.
fn endpoint_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn landing_page(scheme: &str, host: &str) -> String {
    let base = html_escape(&format!("{scheme}://{host}"));
    let host = html_escape(host);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Localtunnel Server</title>
<style>
body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; max-width: 640px; margin: 60px auto; padding: 0 20px; color: #333; }}
h1 {{ color: #4f5bd5; }}
pre {{ background: #f5f5f5; border-left: 4px solid #4f5bd5; padding: 12px; overflow-x: auto; }}
.server {{ font-family: monospace; color: #4f5bd5; }}
</style>
</head>
<body>
<h1>Localtunnel</h1>
<p>Expose your localhost to the world for easy testing and sharing.</p>
<p class="server">Server: <strong>{host}</strong></p>
<h3>Create a tunnel</h3>
<pre>curl "{base}/?new"</pre>
<h3>Create a tunnel with Basic authentication</h3>
<pre>curl "{base}/?new&amp;username=admin&amp;password=secret"</pre>
<p>WebSocket upgrades are supported on every tunnel.</p>
</body>
</html>
"#
    )
}
