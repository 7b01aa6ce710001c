//! Public traffic through live tunnels: auth gate, header injection,
//! failure statuses, and WebSocket splicing.

mod common;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::StatusCode;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Error as WsError, Message};

use common::{
    connect_remote, create_tunnel, get, send, spawn_http_backend, spawn_server,
    spawn_upgrade_refusing_backend, spawn_ws_echo_backend, test_config, tunnel_host,
    wait_connected, DOMAIN,
};

fn port_of(json: &serde_json::Value) -> u16 {
    u16::try_from(json["port"].as_u64().unwrap()).unwrap()
}

#[tokio::test]
async fn test_basic_auth_end_to_end() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_http_backend().await;
    let json = create_tunnel(&server, "/authtest?username=admin&password=secret").await;
    let _remote = connect_remote(port_of(&json), backend, 2);
    wait_connected(&server, "authtest", 2).await;

    let host = tunnel_host("authtest");

    let missing = get(server.addr, &host, "/", None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        missing.header("www-authenticate"),
        Some("Basic realm=\"Localtunnel\"")
    );
    assert_eq!(missing.text(), "401 - Unauthorized");

    let wrong = get(server.addr, &host, "/", Some(("admin", "wrongpass"))).await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let ok = get(server.addr, &host, "/", Some(("admin", "secret"))).await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json(), serde_json::json!({"success": true}));
    assert_eq!(
        ok.header("x-robots-tag"),
        Some("noindex, nofollow, noarchive, nosnippet, nositelinksearchbox, noimageindex")
    );
    assert_eq!(ok.header("x-localtunnel-agent-ips"), Some(r#"["127.0.0.1"]"#));
}

#[tokio::test]
async fn test_unprotected_tunnel_passes_requests_through() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_http_backend().await;
    let json = create_tunnel(&server, "/passthru").await;
    let _remote = connect_remote(port_of(&json), backend, 2);
    wait_connected(&server, "passthru", 2).await;

    let host = tunnel_host("passthru");
    let request = hyper::Request::builder()
        .method("POST")
        .uri("/echo?x=1")
        .header("host", &host)
        .header("x-custom", "kept")
        .header("authorization", "Bearer ignored")
        .body(Full::new(Bytes::from_static(b"hello tunnel")))
        .unwrap();
    let response = send(server.addr, request).await;
    assert_eq!(response.status, StatusCode::OK);

    let echoed = response.json();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["uri"], "/echo?x=1");
    assert_eq!(echoed["body"], "hello tunnel");
    assert_eq!(echoed["headers"]["x-custom"], "kept");
    assert_eq!(echoed["headers"]["authorization"], "Bearer ignored");
    assert_eq!(echoed["headers"]["x-forwarded-host"], host.as_str());
    // Not a secure broker: no protocol hint is invented.
    assert!(echoed["headers"].get("x-forwarded-proto").is_none());
}

#[tokio::test]
async fn test_secure_broker_sets_forwarded_proto() {
    let mut config = test_config();
    config.server.secure = true;
    let server = spawn_server(config).await;
    let backend = spawn_http_backend().await;

    let json = create_tunnel(&server, "/securetun").await;
    assert_eq!(json["url"], format!("https://securetun.{DOMAIN}"));
    let _remote = connect_remote(port_of(&json), backend, 1);
    wait_connected(&server, "securetun", 1).await;

    let response = get(server.addr, &tunnel_host("securetun"), "/echo", None).await;
    assert_eq!(response.json()["headers"]["x-forwarded-proto"], "https");
}

#[tokio::test]
async fn test_unknown_tunnel_is_unavailable() {
    let server = spawn_server(test_config()).await;
    let response = get(server.addr, &tunnel_host("ghosttunnel"), "/", None).await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.header("x-localtunnel-status"), Some("Tunnel Unavailable"));
    assert_eq!(response.text(), "503 - Tunnel Unavailable");
}

#[tokio::test]
async fn test_empty_pool_is_bad_gateway() {
    let mut config = test_config();
    config.tunnel.grace_period_ms = 5_000;
    config.tunnel.borrow_timeout_ms = 100;
    let server = spawn_server(config).await;
    create_tunnel(&server, "/emptypool").await;

    let response = get(server.addr, &tunnel_host("emptypool"), "/", None).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.header("x-localtunnel-error"),
        Some("Local server unavailable")
    );
    assert_eq!(
        response.text(),
        "502 - Bad Gateway: Local server is not available"
    );
}

#[tokio::test]
async fn test_status_counts_pooled_sockets() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_http_backend().await;
    let json = create_tunnel(&server, "/countme").await;
    let _remote = connect_remote(port_of(&json), backend, 3);
    wait_connected(&server, "countme", 3).await;

    let status = get(server.addr, DOMAIN, "/api/tunnels/countme/status", None).await;
    assert_eq!(status.json()["connected_sockets"], 3);
}

async fn ws_connect(
    server_addr: std::net::SocketAddr,
    id: &str,
    auth: Option<(&str, &str)>,
) -> Result<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    WsError,
> {
    let mut request = format!("ws://{}/socket", tunnel_host(id))
        .into_client_request()
        .unwrap();
    if let Some((username, password)) = auth {
        request.headers_mut().insert(
            "authorization",
            ltbroker::auth::basic_auth_header(username, password)
                .parse()
                .unwrap(),
        );
    }
    let stream = TcpStream::connect(server_addr).await.unwrap();
    tokio_tungstenite::client_async(request, stream)
        .await
        .map(|(ws, _)| ws)
}

#[tokio::test]
async fn test_websocket_echo_through_tunnel() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_ws_echo_backend().await;
    let json = create_tunnel(&server, "/wsecho").await;
    let _remote = connect_remote(port_of(&json), backend, 2);
    wait_connected(&server, "wsecho", 2).await;

    let mut ws = ws_connect(server.addr, "wsecho", None).await.unwrap();

    ws.send(Message::text("hello")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "hello");

    ws.send(Message::binary(vec![0u8, 1, 2, 255])).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(&reply.into_data()[..], &[0u8, 1, 2, 255]);
}

#[tokio::test]
async fn test_websocket_respects_auth_gate() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_ws_echo_backend().await;
    let json = create_tunnel(&server, "/wsauth?username=admin&password=secret").await;
    let _remote = connect_remote(port_of(&json), backend, 2);
    wait_connected(&server, "wsauth", 2).await;

    match ws_connect(server.addr, "wsauth", None).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    match ws_connect(server.addr, "wsauth", Some(("admin", "wrongpass"))).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers().get("www-authenticate").unwrap(),
                "Basic realm=\"Localtunnel\""
            );
        }
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let mut ws = ws_connect(server.addr, "wsauth", Some(("admin", "secret")))
        .await
        .unwrap();
    ws.send(Message::text("authed")).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), "authed");
}

#[tokio::test]
async fn test_websocket_to_unknown_tunnel_is_unavailable() {
    let server = spawn_server(test_config()).await;
    match ws_connect(server.addr, "ghostsocket", None).await {
        Err(WsError::Http(response)) => {
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("expected 503, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_websocket_without_tunnel_host_is_bad_request() {
    let server = spawn_server(test_config()).await;
    let request = format!("ws://{DOMAIN}/socket").into_client_request().unwrap();
    let stream = TcpStream::connect(server.addr).await.unwrap();
    match tokio_tungstenite::client_async(request, stream).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_refused_upgrade_is_relayed() {
    let server = spawn_server(test_config()).await;
    let backend = spawn_upgrade_refusing_backend().await;
    let json = create_tunnel(&server, "/refuser").await;
    let _remote = connect_remote(port_of(&json), backend, 1);
    wait_connected(&server, "refuser", 1).await;

    let request = hyper::Request::builder()
        .uri("/socket")
        .header("host", tunnel_host("refuser"))
        .header("upgrade", "websocket")
        .header("connection", "Upgrade")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = send(server.addr, request).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.header("x-refused-by"), Some("backend"));
    assert_eq!(response.text(), "upgrade not accepted");
}

