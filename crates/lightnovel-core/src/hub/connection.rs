//! Per-connection state shared between the hub and a transport's pumps.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Keepalive timing for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Liveness window: silence longer than this marks a connection Dead.
    pub pong_wait: Duration,
    /// Interval between outbound keepalive probes. Must be below `pong_wait`.
    pub ping_period: Duration,
    /// Upper bound on a single outbound write.
    pub write_wait: Duration,
}

impl HeartbeatPolicy {
    /// Derive the probe interval as 9/10 of the liveness window.
    pub fn from_pong_wait(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait,
        }
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self::from_pong_wait(Duration::from_secs(60), Duration::from_secs(10))
    }
}

/// One accepted real-time subscriber.
///
/// Created by the transport after a successful handshake together with the
/// receiving half of its queue ([`Outbound`]). The sending half waits inside
/// the connection until [`BroadcastHub::register`](super::BroadcastHub::register)
/// moves it into the registry.
pub struct Connection {
    id: ConnectionId,
    subscriber_id: String,
    capacity: usize,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last inbound sign of life.
    last_seen_ms: AtomicU64,
    closed: AtomicBool,
    pub(super) pending: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Connection {
    /// Create a connection whose queue holds `capacity` messages (at least one).
    pub fn new(subscriber_id: impl Into<String>, capacity: usize) -> (Arc<Self>, Outbound) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            subscriber_id: subscriber_id.into(),
            capacity,
            created_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            pending: Mutex::new(Some(tx)),
        });
        (connection, Outbound { rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Subscriber/session identifier supplied by the transport (device id).
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    /// Record an inbound keepalive (or any inbound frame).
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis();
        self.last_seen_ms
            .fetch_max(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Time since the last inbound sign of life.
    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }

    /// Alive: not closed and heard from within `window`.
    pub fn is_alive(&self, window: Duration) -> bool {
        !self.is_closed() && self.idle_for() < window
    }

    /// Set once the hub has let go of the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(super) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Receiving half of a connection's queue, drained by the transport's
/// writer pump. Yields `None` once the hub has closed the queue.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Bytes>,
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Take a message that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
