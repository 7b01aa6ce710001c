//! Per-tunnel proxy ("client").
//!
//! A [`TunnelClient`] pairs one [`TunnelAgent`] pool with optional Basic
//! credentials and forwards public traffic over borrowed pool sockets:
//!
//! - plain requests go through a one-shot hyper HTTP/1 client connection, so
//!   both bodies stream with backpressure;
//! - upgrades write the request head verbatim and splice the sockets once the
//!   backend answers `101`.
//!
//! A supervisor task turns the pool's liveness events into the grace-period
//! state machine:
//!
//! ```text
//! GracePending --online--> Online --offline--> OfflineGracePending
//!      |                     ^                        |
//!      |                     +--------online----------+
//!      +--timer--> Closed <------------timer----------+
//! ```
//!
//! Any pool error closes the tunnel unconditionally.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Version},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, info_span, warn, Instrument};

use super::agent::{AgentEvent, AgentStats, PooledConnection, TunnelAgent};
use super::upgrade;
use crate::auth::{validate_credentials, AuthGate, Credentials};

/// Fixed `X-Robots-Tag` set on every proxied response.
pub const ROBOTS_TAG: &str =
    "noindex, nofollow, noarchive, nosnippet, nositelinksearchbox, noimageindex";

const AGENT_IPS_HEADER: &str = "x-localtunnel-agent-ips";
const ERROR_HEADER: &str = "x-localtunnel-error";

/// Proxy behaviour shared by every tunnel on a broker.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Inject `X-Forwarded-Proto: https` when the requester did not.
    pub secure: bool,
    pub grace_period: Duration,
    pub borrow_timeout: Duration,
    pub max_header_bytes: usize,
}

/// Grace-period lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Created; waiting for the first remote socket.
    GracePending,
    /// At least one idle socket is available.
    Online,
    /// The pool drained; the remote client has one grace period to recover.
    OfflineGracePending,
    /// Terminal.
    Closed,
}

/// Notifications for tunnel subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Error(String),
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum GatewayFailure {
    LocalServerUnavailable,
    RequestStreamingFailed,
}

impl GatewayFailure {
    fn reason(self) -> &'static str {
        match self {
            Self::LocalServerUnavailable => "Local server unavailable",
            Self::RequestStreamingFailed => "Request streaming failed",
        }
    }

    fn body(self) -> &'static str {
        match self {
            Self::LocalServerUnavailable => "502 - Bad Gateway: Local server is not available",
            Self::RequestStreamingFailed => "502 - Bad Gateway: Request streaming error",
        }
    }
}

impl IntoResponse for GatewayFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_GATEWAY,
            [
                (header::CONTENT_TYPE, "text/plain"),
                (HeaderName::from_static(ERROR_HEADER), self.reason()),
            ],
            self.body(),
        )
            .into_response()
    }
}

struct ClientInner {
    id: String,
    agent: TunnelAgent,
    credentials: Option<Credentials>,
    options: ClientOptions,
    phase: watch::Sender<ClientPhase>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientInner {
    fn set_phase(&self, next: ClientPhase) {
        self.phase.send_if_modified(|phase| {
            if *phase == ClientPhase::Closed || *phase == next {
                return false;
            }
            *phase = next;
            true
        });
    }

    fn close(&self) {
        let changed = self.phase.send_if_modified(|phase| {
            if *phase == ClientPhase::Closed {
                return false;
            }
            *phase = ClientPhase::Closed;
            true
        });
        if !changed {
            return;
        }
        self.agent.destroy();
        let _ = self.events.send(ClientEvent::Closed);
        info!(id = %self.id, "tunnel closed");
    }
}

/// Handle to one tunnel. Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    /// Wrap a freshly bound pool and start the grace timer.
    ///
    /// `credentials` must only be `Some` when both username and password were
    /// supplied; auth is required iff it is.
    pub fn new(
        id: String,
        agent: TunnelAgent,
        agent_events: mpsc::UnboundedReceiver<AgentEvent>,
        credentials: Option<Credentials>,
        options: ClientOptions,
    ) -> Self {
        let (phase, _) = watch::channel(ClientPhase::GracePending);
        let (events, _) = broadcast::channel(16);
        let grace_period = options.grace_period;

        let inner = Arc::new(ClientInner {
            id,
            agent,
            credentials,
            options,
            phase,
            events,
        });

        let span = info_span!("tunnel", id = %inner.id);
        tokio::spawn(supervise(Arc::downgrade(&inner), agent_events, grace_period).instrument(span));

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Port of the pool listener the remote client connects to.
    pub fn port(&self) -> u16 {
        self.inner.agent.port()
    }

    pub fn stats(&self) -> AgentStats {
        self.inner.agent.stats()
    }

    pub fn phase(&self) -> ClientPhase {
        *self.inner.phase.borrow()
    }

    /// Whether both handles refer to the same tunnel instance.
    pub fn same_as(&self, other: &TunnelClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel the grace timer and destroy the pool. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolve once the tunnel reaches [`ClientPhase::Closed`].
    pub async fn closed(&self) {
        let mut phase = self.inner.phase.subscribe();
        let _ = phase.wait_for(|p| *p == ClientPhase::Closed).await;
    }

    /// Forward a plain HTTP request to the remote backend.
    pub async fn handle_request(&self, mut req: Request) -> Response {
        debug!(method = %req.method(), uri = %req.uri(), "> request");
        inject_forwarding_headers(req.headers_mut(), self.inner.options.secure);

        let conn = match self.inner.agent.borrow(self.inner.options.borrow_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "no tunnel socket for request");
                return GatewayFailure::LocalServerUnavailable.into_response();
            }
        };

        let (mut sender, connection) =
            match hyper::client::conn::http1::handshake(TokioIo::new(conn)).await {
                Ok(parts) => parts,
                Err(e) => {
                    debug!(error = %e, "tunnel socket handshake failed");
                    return GatewayFailure::LocalServerUnavailable.into_response();
                }
            };

        // The socket goes back to the pool only after a clean keep-alive
        // exchange with both bodies read to the end.
        let request_reusable = allows_reuse(req.version(), req.headers());
        let (request_done_tx, request_done) = oneshot::channel();
        let (response_done_tx, response_done) = oneshot::channel();
        let req = req.map(|body| Body::new(TrackedBody::new(body, request_done_tx)));
        tokio::spawn(
            async move {
                let parts = match connection.without_shutdown().await {
                    Ok(parts) => parts,
                    Err(e) => {
                        debug!(error = %e, "tunnel socket closed with error");
                        return;
                    }
                };
                let finished = request_done.await.unwrap_or(false)
                    && response_done.await.unwrap_or(false);
                if request_reusable && finished && parts.read_buf.is_empty() {
                    parts.io.into_inner().recycle();
                }
            }
            .in_current_span(),
        );

        let response = match sender.send_request(req).await {
            Ok(response) => response,
            Err(e) if e.is_user() || e.is_body_write_aborted() => {
                debug!(error = %e, "request body stream failed");
                return GatewayFailure::RequestStreamingFailed.into_response();
            }
            Err(e) => {
                debug!(error = %e, "backend request failed");
                return GatewayFailure::LocalServerUnavailable.into_response();
            }
        };
        debug!(status = %response.status(), "< response");

        let (mut parts, body) = response.into_parts();
        let reusable = allows_reuse(parts.version, &parts.headers);
        inject_response_headers(&mut parts.headers, &self.inner.agent.agent_ips());
        let log_error = |e: hyper::Error| {
            debug!(error = %e, "response body stream failed");
            e
        };
        let body = if reusable {
            Body::new(TrackedBody::new(body, response_done_tx).map_err(log_error))
        } else {
            Body::new(body.map_err(log_error))
        };
        Response::from_parts(parts, body)
    }

    /// Relay a protocol upgrade (WebSocket) to the remote backend.
    pub async fn handle_upgrade(&self, mut req: Request) -> Response {
        debug!(uri = %req.uri(), "> upgrade");

        let mut conn = match self.inner.agent.borrow(self.inner.options.borrow_timeout).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "no tunnel socket for upgrade");
                return GatewayFailure::LocalServerUnavailable.into_response();
            }
        };
        let on_upgrade = hyper::upgrade::on(&mut req);
        let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
        let head = upgrade::format_request_head(
            req.method().as_str(),
            target,
            req.version(),
            req.headers()
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_bytes())),
        );

        if let Err(e) = conn.write_all(&head).await {
            debug!(error = %e, "failed to write upgrade head");
            return GatewayFailure::LocalServerUnavailable.into_response();
        }

        let response_head =
            match upgrade::read_response_head(&mut conn, self.inner.options.max_header_bytes).await {
                Ok(head) => head,
                Err(e) => {
                    debug!(error = %e, "backend did not answer upgrade");
                    return GatewayFailure::LocalServerUnavailable.into_response();
                }
            };
        debug!(status = %response_head.status, "< upgrade");

        if response_head.status != StatusCode::SWITCHING_PROTOCOLS {
            return relay_rejected_upgrade(response_head, conn);
        }

        let upgrade::ResponseHead {
            status,
            headers,
            leftover,
        } = response_head;
        // The idle timeout bounded the wait for the head; the spliced stream
        // may stay quiet indefinitely.
        conn.set_idle_timeout(None);
        tokio::spawn(
            async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        match upgrade::splice(TokioIo::new(upgraded), conn, leftover).await {
                            Ok((up, down)) => debug!(up, down, "upgrade stream finished"),
                            Err(e) => debug!(error = %e, "upgrade stream failed"),
                        }
                    }
                    Err(e) => debug!(error = %e, "public socket gone before upgrade"),
                }
            }
            .in_current_span(),
        );

        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Backend declined the upgrade: relay its answer as an ordinary response.
fn relay_rejected_upgrade(head: upgrade::ResponseHead, conn: PooledConnection) -> Response {
    let content_length = head.content_length();
    let chunked = head.is_chunked();
    let upgrade::ResponseHead {
        status,
        mut headers,
        leftover,
    } = head;

    let rest = std::io::Cursor::new(leftover).chain(conn);
    let body = match content_length {
        Some(len) => Body::from_stream(ReaderStream::new(rest.take(len))),
        // Chunk framing cannot be re-encoded from raw bytes; drop the body.
        None if chunked => {
            headers.remove(header::TRANSFER_ENCODING);
            Body::empty()
        }
        None => Body::from_stream(ReaderStream::new(rest)),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// HTTP/1.1 without `Connection: close`.
fn allows_reuse(version: Version, headers: &HeaderMap) -> bool {
    version == Version::HTTP_11
        && !headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Body wrapper that reports, once dropped, whether it was read to the end.
struct TrackedBody<B> {
    inner: B,
    finished: AtomicBool,
    report: Option<oneshot::Sender<bool>>,
}

impl<B> TrackedBody<B> {
    fn new(inner: B, report: oneshot::Sender<bool>) -> Self {
        Self {
            inner,
            finished: AtomicBool::new(false),
            report: Some(report),
        }
    }
}

impl<B> HttpBody for TrackedBody<B>
where
    B: HttpBody + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.finished.store(true, Ordering::Relaxed),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => {
                this.finished.store(true, Ordering::Relaxed);
            }
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        let end = self.inner.is_end_stream();
        if end {
            self.finished.store(true, Ordering::Relaxed);
        }
        end
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for TrackedBody<B> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            let _ = report.send(*self.finished.get_mut());
        }
    }
}

impl AuthGate for TunnelClient {
    fn requires_auth(&self) -> bool {
        self.inner.credentials.is_some()
    }

    fn validate_auth(&self, username: &str, password: &str) -> bool {
        let Some(expected) = &self.inner.credentials else {
            return true;
        };
        let provided = Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };
        validate_credentials(&provided, expected)
    }
}

/// Set `X-Forwarded-Proto` (secure tunnels only) and `X-Forwarded-Host` unless
/// an upstream proxy already did.
pub fn inject_forwarding_headers(headers: &mut HeaderMap, secure: bool) {
    if secure && !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    }
    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = headers.get(header::HOST).cloned() {
            headers.insert("x-forwarded-host", host);
        }
    }
}

/// Overwrite `X-Robots-Tag` and expose the remote client's IPs.
pub fn inject_response_headers(headers: &mut HeaderMap, agent_ips: &[std::net::IpAddr]) {
    headers.insert("x-robots-tag", HeaderValue::from_static(ROBOTS_TAG));
    if agent_ips.is_empty() {
        return;
    }
    let encoded = serde_json::to_string(agent_ips).unwrap_or_default();
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        headers.insert(AGENT_IPS_HEADER, value);
    }
}

/// Drive the grace-period state machine from the pool's events.
///
/// Holds only a weak reference so dropping every [`TunnelClient`] handle
/// tears the pool down and ends this task.
async fn supervise(
    client: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    grace_period: Duration,
) {
    let mut deadline = Some(Instant::now() + grace_period);
    loop {
        let event = match deadline {
            Some(at) => tokio::select! {
                event = events.recv() => event,
                () = tokio::time::sleep_until(at) => {
                    let Some(inner) = client.upgrade() else { return };
                    // Sockets still lent out count as a live backend.
                    if inner.agent.connected_sockets() > 0 {
                        debug!("grace period elapsed with sockets in use, extending");
                        deadline = Some(Instant::now() + grace_period);
                        continue;
                    }
                    info!("no tunnel socket within grace period");
                    inner.close();
                    return;
                }
            },
            None => events.recv().await,
        };

        let Some(inner) = client.upgrade() else {
            return;
        };
        match event {
            Some(AgentEvent::Online) => {
                deadline = None;
                inner.set_phase(ClientPhase::Online);
                debug!("tunnel online");
            }
            Some(AgentEvent::Offline) => {
                deadline = Some(Instant::now() + grace_period);
                inner.set_phase(ClientPhase::OfflineGracePending);
                debug!("tunnel offline, grace period armed");
            }
            Some(AgentEvent::Error(message)) => {
                warn!(error = %message, "tunnel agent failed");
                let _ = inner.events.send(ClientEvent::Error(message));
                inner.close();
                return;
            }
            Some(AgentEvent::Closed) | None => {
                inner.close();
                return;
            }
        }
    }
}
