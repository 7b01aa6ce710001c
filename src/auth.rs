//! HTTP Basic authentication for protected tunnels.
//!
//! A tunnel created with both `username` and `password` only accepts public
//! requests carrying `Authorization: Basic base64(username:password)`. The
//! gate runs in the router before dispatch and applies identically to plain
//! requests and WebSocket upgrades.
//!
//! Credentials are kept in plain memory and handed back verbatim in the
//! creation response; nothing is hashed.

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::Engine;
use rand::RngCore;

use crate::util::hex;

/// Realm advertised in `WWW-Authenticate` challenges.
pub const REALM: &str = "Localtunnel";

/// Random bytes behind a generated password (hex-encoded to twice the length).
const PASSWORD_BYTES: usize = 9;

/// Username/password pair decoded from a `Basic` header or stored on a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Generate a random tunnel password: 9 random bytes as 18 lowercase hex chars.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(&bytes)
}

/// Parse an `Authorization` header value of the form `Basic <base64>`.
///
/// Returns `None` for other schemes, undecodable payloads, payloads without a
/// `:` separator, and empty usernames. The password is everything after the
/// first `:` and may itself contain colons.
pub fn parse_basic_auth(header_value: &str) -> Option<Credentials> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username.is_empty() {
        return None;
    }
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Build an `Authorization` header value for the given credentials.
pub fn basic_auth_header(username: &str, password: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the secret length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Compare provided credentials against the expected pair.
///
/// Both fields are always compared so a username mismatch costs the same as
/// a password mismatch.
pub fn validate_credentials(provided: &Credentials, expected: &Credentials) -> bool {
    let user_ok = constant_time_eq(expected.username.as_bytes(), provided.username.as_bytes());
    let pass_ok = constant_time_eq(expected.password.as_bytes(), provided.password.as_bytes());
    user_ok & pass_ok
}

/// Anything that may demand credentials before serving a request.
pub trait AuthGate {
    fn requires_auth(&self) -> bool;
    fn validate_auth(&self, username: &str, password: &str) -> bool;
}

/// Apply the auth gate to a request's headers.
///
/// Passes when the target does not require auth. Otherwise the request needs a
/// decodable `Basic` header whose credentials validate; anything else yields
/// the 401 challenge response.
pub fn authorize(headers: &HeaderMap, gate: &impl AuthGate) -> Result<(), Response> {
    if !gate.requires_auth() {
        return Ok(());
    }

    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth);

    match credentials {
        Some(c) if gate.validate_auth(&c.username, &c.password) => Ok(()),
        _ => Err(unauthorized()),
    }
}

/// `401 Unauthorized` with the Basic challenge.
pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::WWW_AUTHENTICATE, format!("Basic realm=\"{REALM}\"")),
            (header::CONTENT_TYPE, "text/plain".to_string()),
        ],
        "401 - Unauthorized",
    )
        .into_response()
}
