//! End-to-end tests for the realtime push endpoint.
//!
//! A real server is bound to an ephemeral port and driven with a
//! tokio-tungstenite client. Redis is disabled, so no Docker is needed.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lightnovel_server::realtime::{NoticeLevel, NovelUpdate, UpdateKind};
use lightnovel_server::{AppConfig, AppState, build_app, build_state};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest, http::HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.enabled = false;
    cfg.scheduler.workers = 2;
    cfg
}

async fn start_server(cfg: AppConfig) -> TestServer {
    let shutdown = CancellationToken::new();
    let (state, _reaper) = build_state(&cfg, &shutdown).await;
    let app = build_app(state.clone());

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await;
    });

    TestServer {
        addr,
        state,
        shutdown,
    }
}

async fn connect(addr: SocketAddr, device: Option<&'static str>) -> Client {
    let mut request = format!("ws://{addr}/api/v1/ws")
        .into_client_request()
        .expect("request");
    if let Some(device) = device {
        request
            .headers_mut()
            .insert("X-Device-ID", HeaderValue::from_static(device));
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("websocket handshake");
    ws
}

/// Poll `cond` until it holds or `limit` passes.
async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> Value {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.expect("read");
    let (head, body) = raw.split_once("\r\n\r\n").expect("http response");
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");
    serde_json::from_str(body).expect("json body")
}

#[tokio::test]
async fn broadcast_reaches_connected_clients() {
    let server = start_server(test_config()).await;
    let mut a = connect(server.addr, Some("device-a")).await;
    let mut b = connect(server.addr, None).await;

    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 2).await);

    let report = server
        .state
        .notifier
        .novel_update(NovelUpdate::new("42", "Spice and Wolf", UpdateKind::NewChapter))
        .expect("broadcast");
    assert_eq!(report.delivered, 2);

    for client in [&mut a, &mut b] {
        let msg = next_json(client).await;
        assert_eq!(msg["type"], "novel_update");
        assert_eq!(msg["data"]["novelId"], "42");
        assert_eq!(msg["data"]["updateType"], "new_chapter");
    }
}

#[tokio::test]
async fn messages_arrive_in_broadcast_order() {
    let server = start_server(test_config()).await;
    let mut client = connect(server.addr, Some("ordered")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);

    for i in 0..20 {
        server
            .state
            .notifier
            .system_notice(NoticeLevel::Info, format!("notice {i}"))
            .expect("broadcast");
    }
    for i in 0..20 {
        let msg = next_json(&mut client).await;
        assert_eq!(msg["type"], "system_notice");
        assert_eq!(msg["data"]["content"], format!("notice {i}"));
    }
}

#[tokio::test]
async fn client_close_unregisters_connection() {
    let server = start_server(test_config()).await;
    let mut client = connect(server.addr, Some("leaving")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);

    client.close(None).await.expect("close");
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 0).await);

    // Broadcasting to nobody is fine.
    let report = server
        .state
        .notifier
        .system_notice(NoticeLevel::Info, "anyone there?")
        .expect("broadcast");
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn hub_shutdown_sends_close_frame() {
    let server = start_server(test_config()).await;
    let mut client = connect(server.addr, Some("staying")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);

    assert_eq!(hub.shutdown(), 1);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = client.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
        true
    })
    .await
    .expect("socket closed in time");
    assert!(closed);
}

#[tokio::test]
async fn upgrade_after_hub_shutdown_is_not_registered() {
    let server = start_server(test_config()).await;
    let hub = server.state.hub.clone();
    assert_eq!(hub.shutdown(), 0);

    let mut late = connect(server.addr, Some("late")).await;
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match late.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket should end once refused");
    assert_eq!(hub.connection_count(), 0);
}

#[tokio::test]
async fn silent_client_is_dropped_after_liveness_window() {
    let mut cfg = test_config();
    cfg.realtime.pong_wait_secs = 2;
    let server = start_server(cfg).await;

    // Never polled, so the client never answers the server's pings.
    let _client = connect(server.addr, Some("silent")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);
    assert!(eventually(Duration::from_secs(5), || hub.connection_count() == 0).await);
}

#[tokio::test]
async fn oversized_client_frame_closes_connection() {
    let server = start_server(test_config()).await;
    let mut client = connect(server.addr, Some("chatty")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);

    let _ = client.send(Message::Text("x".repeat(4096))).await;
    assert!(eventually(Duration::from_secs(3), || hub.connection_count() == 0).await);
}

#[tokio::test]
async fn status_endpoint_reports_hub_stats() {
    let server = start_server(test_config()).await;
    let _client = connect(server.addr, Some("watcher")).await;
    let hub = server.state.hub.clone();
    assert!(eventually(Duration::from_secs(2), || hub.connection_count() == 1).await);

    let status = http_get(server.addr, "/api/v1/ws/status").await;
    assert_eq!(status["code"], 0);
    assert_eq!(status["data"]["connections"], 1);

    let health = http_get(server.addr, "/healthz").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cache"]["remoteTier"], "memory");
}
