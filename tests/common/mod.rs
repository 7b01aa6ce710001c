//! Shared fixtures: a broker on an ephemeral port, HTTP and WebSocket
//! backends, and a minimal remote tunnel client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    http::{HeaderMap, Method, Uri},
    routing::{self, any},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use ltbroker::{app, AppState, Config};

pub const DOMAIN: &str = "example.com";

/// Defaults tuned for tests: loopback pools, short timeouts.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.server.domain = Some(DOMAIN.to_string());
    config.tunnel.bind_address = "127.0.0.1".to_string();
    config.tunnel.grace_period_ms = 1000;
    config.tunnel.borrow_timeout_ms = 1000;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_server(config: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config);
    let router = app(state.clone());
    let task = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestServer { addr, state, task }
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Send one request over a fresh HTTP/1 connection.
pub async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> HttpResponse {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender.send_request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    HttpResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

pub async fn get(addr: SocketAddr, host: &str, path: &str, auth: Option<(&str, &str)>) -> HttpResponse {
    let mut builder = Request::builder().uri(path).header("host", host);
    if let Some((username, password)) = auth {
        builder = builder.header(
            "authorization",
            ltbroker::auth::basic_auth_header(username, password),
        );
    }
    send(addr, builder.body(Full::new(Bytes::new())).unwrap()).await
}

/// Create a tunnel through the management API and return the JSON body.
pub async fn create_tunnel(server: &TestServer, path_and_query: &str) -> Value {
    let response = get(server.addr, DOMAIN, path_and_query, None).await;
    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    response.json()
}

pub fn tunnel_host(id: &str) -> String {
    format!("{id}.{DOMAIN}")
}

/// HTTP backend: `GET /` answers `{"success":true}`, `/echo` reflects the request.
pub async fn spawn_http_backend() -> SocketAddr {
    let router = Router::new()
        .route("/", routing::get(|| async { Json(json!({"success": true})) }))
        .route("/echo", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    Json(json!({
        "method": method.as_str(),
        "uri": uri.to_string(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

/// WebSocket backend echoing text and binary frames.
pub async fn spawn_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Backend that refuses every upgrade with `400` and a short plain-text body.
pub async fn spawn_upgrade_refusing_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 400 Bad Request\r\n\
                          Content-Type: text/plain\r\n\
                          X-Refused-By: backend\r\n\
                          Content-Length: 20\r\n\r\n\
                          upgrade not accepted",
                    )
                    .await;
            });
        }
    });
    addr
}

/// Stand-in for a remote tunnel client: keeps `slots` sockets open to the
/// tunnel port, pipes each to a fresh backend connection, and reconnects
/// whenever one finishes. Dropping it disconnects everything.
pub struct RemoteClient {
    _tasks: JoinSet<()>,
}

pub fn connect_remote(tunnel_port: u16, backend: SocketAddr, slots: usize) -> RemoteClient {
    let mut tasks = JoinSet::new();
    for _ in 0..slots {
        tasks.spawn(async move {
            loop {
                let Ok(mut remote) = TcpStream::connect(("127.0.0.1", tunnel_port)).await else {
                    return;
                };
                let Ok(mut local) = TcpStream::connect(backend).await else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut remote, &mut local).await;
            }
        });
    }
    RemoteClient { _tasks: tasks }
}

/// Wait until the tunnel's pool holds at least `n` sockets.
pub async fn wait_connected(server: &TestServer, id: &str, n: usize) {
    for _ in 0..200 {
        if let Some(client) = server.state.manager.get_client(id).await {
            if client.stats().connected_sockets >= n {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tunnel {id} never reached {n} connected sockets");
}

/// Wait until the registry no longer lists `id`.
pub async fn wait_removed(server: &TestServer, id: &str) {
    for _ in 0..300 {
        if !server.state.manager.has_client(id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tunnel {id} was never removed");
}
