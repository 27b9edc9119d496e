//! WebSocket endpoint feeding the broadcast hub.
//!
//! Each socket gets two pumps:
//!
//! ```text
//!  client ──frames──► read pump ──touch()──► Connection (liveness)
//!  client ◄─frames─── write pump ◄─recv()─── Outbound queue ◄── hub.broadcast
//! ```
//!
//! Whichever pump stops first unregisters the connection. Unregistering
//! closes the outbound queue, which makes the write pump send a close frame
//! and exit.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use lightnovel_core::{BroadcastHub, Connection, HeartbeatPolicy, Outbound};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RealtimeConfig;
use crate::server::AppState;

/// Header carrying the client's stable device identifier.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Per-socket parameters derived from [`RealtimeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RealtimeSettings {
    pub send_queue_capacity: usize,
    pub max_message_size: usize,
    pub heartbeat: HeartbeatPolicy,
}

impl From<&RealtimeConfig> for RealtimeSettings {
    fn from(cfg: &RealtimeConfig) -> Self {
        Self {
            send_queue_capacity: cfg.send_queue_capacity,
            max_message_size: cfg.max_message_size,
            heartbeat: cfg.heartbeat(),
        }
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

/// `GET /api/v1/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let subscriber = subscriber_id(&headers, peer);
    let settings = state.realtime;
    let hub = state.hub.clone();

    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, subscriber, hub, settings))
}

/// Device id from the header, or the peer address when absent.
fn subscriber_id(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn serve_socket(
    socket: WebSocket,
    subscriber: String,
    hub: Arc<BroadcastHub>,
    settings: RealtimeSettings,
) {
    let (conn, outbound) = Connection::new(subscriber, settings.send_queue_capacity);
    if !hub.register(&conn) {
        return;
    }
    info!(
        conn = %conn.id(),
        subscriber = conn.subscriber_id(),
        connections = hub.connection_count(),
        "realtime client connected"
    );

    let (sink, stream) = socket.split();
    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(write_pump(
        sink,
        outbound,
        conn.clone(),
        hub.clone(),
        settings.heartbeat,
        writer_done.clone(),
    ));

    read_pump(stream, &conn, settings.heartbeat, &writer_done).await;
    hub.unregister(&conn);
    let _ = writer.await;

    info!(
        conn = %conn.id(),
        connections = hub.connection_count(),
        "realtime client disconnected"
    );
}

/// Reads until the client goes quiet for longer than the liveness window,
/// closes, errors, or the writer gives up.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    conn: &Connection,
    heartbeat: HeartbeatPolicy,
    writer_done: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = writer_done.cancelled() => break,
            next = timeout(heartbeat.pong_wait, stream.next()) => next,
        };
        match next {
            Err(_) => {
                debug!(conn = %conn.id(), "liveness window elapsed");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(conn = %conn.id(), error = %e, "read failed");
                break;
            }
            // Pongs, pings and stray client frames all prove the peer is there.
            Ok(Some(Ok(_))) => conn.touch(),
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: Outbound,
    conn: Arc<Connection>,
    hub: Arc<BroadcastHub>,
    heartbeat: HeartbeatPolicy,
    done: CancellationToken,
) {
    let mut ping = interval_at(Instant::now() + heartbeat.ping_period, heartbeat.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            queued = outbound.recv() => match queued {
                Some(payload) => payload_frame(payload),
                None => {
                    let _ = timeout(heartbeat.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(heartbeat.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                debug!(conn = %conn.id(), "write timed out");
                break;
            }
        }
    }

    hub.unregister(&conn);
    done.cancel();
}

fn payload_frame(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}
