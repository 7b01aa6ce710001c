//! Per-tunnel connection pool ("agent").
//!
//! Each tunnel owns one [`TunnelAgent`]: a dedicated TCP listener that the
//! remote tunnel client dials repeatedly. Accepted sockets sit in an idle FIFO
//! until a public request borrows one. The remote side can only push sockets,
//! never be asked for one, so borrows on an empty pool wait (bounded by a
//! deadline) for the next accepted socket.
//!
//! ## Concurrency
//!
//! All pool state lives in a single actor task. Borrows, accepts, idle-socket
//! closures and lease releases all arrive as messages, so a socket popped for
//! one borrow can never be handed to another. Readers that only need counters
//! use the [`AgentStats`] snapshot published on a `watch` channel.
//!
//! ## Liveness
//!
//! The agent reports [`AgentEvent::Online`] when the idle queue goes from empty
//! to non-empty and [`AgentEvent::Offline`] when it drains back to empty, whether
//! by a borrow or by idle sockets closing. The owning tunnel client turns those
//! into its grace-period timer.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::AgentError;

/// Liveness notifications sent to the agent's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// The idle queue went from empty to non-empty.
    Online,
    /// The idle queue drained to empty.
    Offline,
    /// The listener failed fatally. Always followed by [`AgentEvent::Closed`].
    Error(String),
    /// The agent was destroyed. Sent exactly once, last.
    Closed,
}

/// Point-in-time view of a pool, published after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    /// Idle plus lent-out sockets.
    pub connected_sockets: usize,
    pub idle_sockets: usize,
    pub online: bool,
    /// Borrows queued on an empty pool.
    pub waiting_borrows: usize,
    /// Distinct remote IPs seen, in first-seen order.
    pub agent_ips: Vec<IpAddr>,
}

/// Settings for a new pool.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Tunnel id, for logging.
    pub id: String,
    /// Address the listener binds to; the port is always ephemeral.
    pub bind_address: String,
    /// Sockets beyond this many (idle + lent) are closed on accept.
    pub max_sockets: usize,
    /// Read-inactivity timeout applied to every borrowed socket.
    pub idle_timeout: Option<Duration>,
}

enum Command {
    Borrow(oneshot::Sender<PooledConnection>),
    Released,
    Recycle(TcpStream, SocketAddr),
    IdleClosed(u64),
    Destroy,
}

/// Handle to a tunnel's connection pool.
///
/// Not `Clone`: the owning tunnel client holds the only handle, and dropping
/// it destroys the pool.
pub struct TunnelAgent {
    id: String,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<AgentStats>,
}

impl TunnelAgent {
    /// Bind the pool's listener on an ephemeral port and start the actor.
    ///
    /// Returns the handle and the receiver for its [`AgentEvent`]s.
    pub async fn listen(
        options: AgentOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentEvent>), AgentError> {
        let listener = TcpListener::bind((options.bind_address.as_str(), 0))
            .await
            .map_err(AgentError::Bind)?;
        let local_addr = listener.local_addr().map_err(AgentError::Bind)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(AgentStats::default());

        let actor = AgentActor {
            listener,
            commands: command_rx,
            command_tx: command_tx.clone(),
            events: event_tx,
            stats: stats_tx,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            leased: 0,
            agent_ips: Vec::new(),
            online: false,
            max_sockets: options.max_sockets,
            idle_timeout: options.idle_timeout,
            next_socket_id: 0,
        };

        let span = info_span!("agent", id = %options.id, port = local_addr.port());
        tokio::spawn(actor.run().instrument(span));
        info!(id = %options.id, port = local_addr.port(), "tunnel agent listening");

        Ok((
            Self {
                id: options.id,
                local_addr,
                commands: command_tx,
                stats: stats_rx,
            },
            event_rx,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Port the remote tunnel client must connect to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> AgentStats {
        self.stats.borrow().clone()
    }

    /// Idle plus lent-out sockets.
    pub fn connected_sockets(&self) -> usize {
        self.stats.borrow().connected_sockets
    }

    /// Distinct remote IPs that have connected to this pool.
    pub fn agent_ips(&self) -> Vec<IpAddr> {
        self.stats.borrow().agent_ips.clone()
    }

    /// Take one idle socket, waiting up to `timeout` for the remote client to
    /// supply one if the pool is empty.
    pub async fn borrow(&self, timeout: Duration) -> Result<PooledConnection, AgentError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Borrow(reply_tx))
            .map_err(|_| AgentError::Closed)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(AgentError::Closed),
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }

    /// Close the listener and every idle socket, and fail all waiting borrows.
    /// Idempotent.
    pub fn destroy(&self) {
        let _ = self.commands.send(Command::Destroy);
    }

    #[cfg(test)]
    pub(crate) fn stats_receiver(&self) -> watch::Receiver<AgentStats> {
        self.stats.clone()
    }
}

impl Drop for TunnelAgent {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct IdleSocket {
    id: u64,
    remote_addr: SocketAddr,
    release: oneshot::Sender<()>,
    watcher: JoinHandle<Option<TcpStream>>,
}

struct AgentActor {
    listener: TcpListener,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<AgentEvent>,
    stats: watch::Sender<AgentStats>,
    idle: VecDeque<IdleSocket>,
    waiters: VecDeque<oneshot::Sender<PooledConnection>>,
    leased: usize,
    agent_ips: Vec<IpAddr>,
    online: bool,
    max_sockets: usize,
    idle_timeout: Option<Duration>,
    next_socket_id: u64,
}

impl AgentActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Borrow(reply)) => self.on_borrow(reply).await,
                    Some(Command::Released) => {
                        self.leased = self.leased.saturating_sub(1);
                        self.publish();
                    }
                    Some(Command::Recycle(stream, remote_addr)) => {
                        self.leased = self.leased.saturating_sub(1);
                        debug!(remote = %remote_addr, "tunnel socket returned to pool");
                        self.push_idle(stream, remote_addr);
                        self.serve_waiters().await;
                    }
                    Some(Command::IdleClosed(socket_id)) => self.on_idle_closed(socket_id),
                    Some(Command::Destroy) | None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => self.on_accept(stream, remote_addr).await,
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!(error = %e, "transient accept error");
                    }
                    Err(e) => {
                        warn!(error = %e, "tunnel listener failed");
                        let _ = self.events.send(AgentEvent::Error(e.to_string()));
                        break;
                    }
                },
            }
        }
        self.shutdown();
    }

    fn connected(&self) -> usize {
        self.idle.len() + self.leased
    }

    async fn on_accept(&mut self, stream: TcpStream, remote_addr: SocketAddr) {
        if self.connected() >= self.max_sockets {
            debug!(remote = %remote_addr, max = self.max_sockets, "pool full, closing socket");
            return;
        }

        let ip = remote_addr.ip();
        if !self.agent_ips.contains(&ip) {
            self.agent_ips.push(ip);
        }
        debug!(remote = %remote_addr, connected = self.connected() + 1, "tunnel socket connected");

        self.push_idle(stream, remote_addr);
        self.serve_waiters().await;
    }

    async fn on_borrow(&mut self, reply: oneshot::Sender<PooledConnection>) {
        match self.take_idle().await {
            Some(conn) => self.deliver(reply, conn),
            None => {
                // Borrows that timed out leave closed senders behind.
                self.waiters.retain(|w| !w.is_closed());
                self.waiters.push_back(reply);
                self.publish();
            }
        }
    }

    fn on_idle_closed(&mut self, socket_id: u64) {
        let before = self.idle.len();
        self.idle.retain(|s| s.id != socket_id);
        if self.idle.len() != before {
            debug!(socket = socket_id, "idle tunnel socket closed by remote");
            self.refresh();
        }
    }

    /// Hand freshly idle sockets to borrows that queued while the pool was empty.
    async fn serve_waiters(&mut self) {
        while !self.idle.is_empty() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.is_closed() {
                continue;
            }
            let Some(conn) = self.take_idle().await else {
                self.waiters.push_front(waiter);
                break;
            };
            self.deliver(waiter, conn);
        }
    }

    /// Send a connection to a borrower, returning it to the pool if the
    /// borrower gave up in the meantime.
    fn deliver(&mut self, reply: oneshot::Sender<PooledConnection>, conn: PooledConnection) {
        if let Err(conn) = reply.send(conn) {
            let (stream, remote_addr) = conn.into_parts();
            self.leased = self.leased.saturating_sub(1);
            self.push_idle(stream, remote_addr);
        }
    }

    fn push_idle(&mut self, stream: TcpStream, remote_addr: SocketAddr) {
        let id = self.next_socket_id;
        self.next_socket_id += 1;

        let (release_tx, release_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_idle(id, stream, release_rx, self.command_tx.clone()));
        self.idle.push_back(IdleSocket {
            id,
            remote_addr,
            release: release_tx,
            watcher,
        });
        self.refresh();
    }

    /// Pop the oldest live idle socket, skipping any that closed meanwhile.
    async fn take_idle(&mut self) -> Option<PooledConnection> {
        while let Some(socket) = self.idle.pop_front() {
            let _ = socket.release.send(());
            match socket.watcher.await {
                Ok(Some(stream)) => {
                    self.leased += 1;
                    self.refresh();
                    return Some(PooledConnection {
                        stream,
                        remote_addr: socket.remote_addr,
                        idle_timeout: self.idle_timeout,
                        idle_timer: None,
                        lease: Lease {
                            commands: self.command_tx.clone(),
                            armed: true,
                        },
                    });
                }
                Ok(None) | Err(_) => {
                    debug!(socket = socket.id, "skipping tunnel socket closed while idle");
                }
            }
        }
        self.refresh();
        None
    }

    /// Recompute liveness, emitting Online/Offline on transitions, and
    /// publish a fresh snapshot.
    fn refresh(&mut self) {
        let online = !self.idle.is_empty();
        if online != self.online {
            self.online = online;
            let event = if online {
                AgentEvent::Online
            } else {
                AgentEvent::Offline
            };
            debug!(?event, "agent liveness changed");
            let _ = self.events.send(event);
        }
        self.publish();
    }

    fn publish(&self) {
        self.stats.send_replace(AgentStats {
            connected_sockets: self.connected(),
            idle_sockets: self.idle.len(),
            online: self.online,
            waiting_borrows: self.waiters.len(),
            agent_ips: self.agent_ips.clone(),
        });
    }

    fn shutdown(&mut self) {
        for socket in self.idle.drain(..) {
            socket.watcher.abort();
        }
        let failed_waiters = self.waiters.len();
        // Dropping the reply senders fails every pending borrow with `Closed`.
        self.waiters.clear();
        self.online = false;
        self.publish();
        let _ = self.events.send(AgentEvent::Closed);
        info!(failed_waiters, "tunnel agent closed");
    }
}

/// Hold an idle socket until the actor claims it, reporting a remote close.
async fn watch_idle(
    socket_id: u64,
    stream: TcpStream,
    mut release: oneshot::Receiver<()>,
    commands: mpsc::UnboundedSender<Command>,
) -> Option<TcpStream> {
    enum Probe {
        Released,
        Closed,
        Data,
    }

    let mut probe = [0u8; 1];
    let outcome = tokio::select! {
        _ = &mut release => Probe::Released,
        read = stream.peek(&mut probe) => match read {
            Ok(0) | Err(_) => Probe::Closed,
            Ok(_) => Probe::Data,
        },
    };

    match outcome {
        Probe::Released => Some(stream),
        Probe::Closed => {
            let _ = commands.send(Command::IdleClosed(socket_id));
            None
        }
        Probe::Data => {
            // Early bytes stay buffered in the socket for whoever borrows it.
            let _ = release.await;
            Some(stream)
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Reports a lent-out socket's end of life back to its pool.
struct Lease {
    commands: mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Released);
        }
    }
}

/// A socket borrowed from a [`TunnelAgent`].
///
/// Reads fail with [`io::ErrorKind::TimedOut`] after the configured idle
/// timeout passes without any bytes arriving. Dropping the connection closes
/// the socket and releases its slot in the pool's socket count.
pub struct PooledConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    idle_timeout: Option<Duration>,
    idle_timer: Option<Pin<Box<Sleep>>>,
    lease: Lease,
}

impl PooledConnection {
    /// Address of the remote tunnel client end of this socket.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Replace the read-inactivity timeout; `None` disables it.
    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
        self.idle_timer = None;
    }

    /// Hand the socket back to its pool as idle, for a connection that
    /// finished an exchange and can carry another one. The pool must not be
    /// given a socket with unread or unsent bytes in flight.
    pub fn recycle(self) {
        let commands = self.lease.commands.clone();
        let (stream, remote_addr) = self.into_parts();
        let _ = commands.send(Command::Recycle(stream, remote_addr));
    }

    fn into_parts(mut self) -> (TcpStream, SocketAddr) {
        self.lease.armed = false;
        (self.stream, self.remote_addr)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("remote_addr", &self.remote_addr)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.idle_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let Some(timeout) = this.idle_timeout else {
                    return Poll::Pending;
                };
                let timer = this
                    .idle_timer
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                if timer.as_mut().poll(cx).is_ready() {
                    this.idle_timer = None;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "tunnel socket idle timeout",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
