//! Connection registry and non-blocking fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId, HeartbeatPolicy};

const HUB_CONNECTIONS: &str = "hub_connections";
const HUB_MESSAGES_SENT_TOTAL: &str = "hub_messages_sent_total";
const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";

/// Why a connection was dropped by the hub rather than by its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Queue full: the subscriber is not draining fast enough.
    SlowConsumer,
    /// Silent for longer than the liveness window.
    Dead,
    /// The transport dropped its end of the queue.
    Disconnected,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow_consumer",
            Self::Dead => "dead",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Outcome of a single [`BroadcastHub::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Hub status snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub connections: usize,
    pub messages_sent: u64,
    pub evictions: u64,
    pub uptime_secs: u64,
}

/// Registered connection together with the only sender of its queue.
struct Subscriber {
    conn: Arc<Connection>,
    tx: mpsc::Sender<Bytes>,
}

/// Registry of live push connections.
///
/// Register, unregister, broadcast and sweeps all run under one mutex, so a
/// broadcast never observes a half-applied registration and never delivers
/// twice to the same connection. Nothing awaits while the lock is held:
/// fan-out uses `try_send` and connections that cannot take a message are
/// evicted on the spot.
pub struct BroadcastHub {
    registry: Mutex<HashMap<ConnectionId, Subscriber>>,
    /// Set by [`BroadcastHub::shutdown`]; written under the registry lock.
    closed: AtomicBool,
    liveness_window: Duration,
    messages_sent: AtomicU64,
    evictions: AtomicU64,
    started_at: Instant,
}

impl BroadcastHub {
    /// Create a hub that presumes connections dead after `liveness_window`
    /// of silence.
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            liveness_window,
            messages_sent: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn with_policy(policy: &HeartbeatPolicy) -> Self {
        Self::new(policy.pong_wait)
    }

    /// Create a new hub wrapped in an Arc for sharing.
    pub fn new_shared(liveness_window: Duration) -> Arc<Self> {
        Arc::new(Self::new(liveness_window))
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Add a connection; later broadcasts reach it.
    ///
    /// Returns `false` if the connection was already registered or already
    /// unregistered, or if the hub has shut down. A connection refused by a
    /// shut-down hub has its queue closed.
    pub fn register(&self, conn: &Arc<Connection>) -> bool {
        let mut registry = self.registry.lock();
        if self.closed.load(Ordering::Acquire) {
            let refused = conn.pending.lock().take();
            drop(registry);
            conn.mark_closed();
            drop(refused);
            debug!(connection_id = %conn.id(), "hub shut down, connection refused");
            return false;
        }
        let Some(tx) = conn.pending.lock().take() else {
            debug!(connection_id = %conn.id(), "connection already registered or closed");
            return false;
        };
        registry.insert(
            conn.id(),
            Subscriber {
                conn: Arc::clone(conn),
                tx,
            },
        );
        let count = registry.len();
        drop(registry);

        metrics::gauge!(HUB_CONNECTIONS).set(count as f64);
        debug!(
            connection_id = %conn.id(),
            subscriber = %conn.subscriber_id(),
            connections = count,
            "connection registered"
        );
        true
    }

    /// Remove a connection and close its queue.
    ///
    /// Safe to call repeatedly and for connections that were never
    /// registered; their queue is closed as well. Returns `true` only when
    /// the connection was in the registry.
    pub fn unregister(&self, conn: &Connection) -> bool {
        let mut registry = self.registry.lock();
        let removed = registry.remove(&conn.id());
        let never_registered = conn.pending.lock().take();
        let count = registry.len();
        drop(registry);

        // Removal above strictly precedes closing the queue here.
        conn.mark_closed();
        drop(never_registered);
        let was_registered = removed.is_some();
        drop(removed);

        if was_registered {
            metrics::gauge!(HUB_CONNECTIONS).set(count as f64);
            debug!(
                connection_id = %conn.id(),
                subscriber = %conn.subscriber_id(),
                connections = count,
                "connection unregistered"
            );
        }
        was_registered
    }

    /// Offer `payload` to every Alive connection without waiting.
    ///
    /// Connections that are Dead, whose queue is full, or whose transport has
    /// gone away are evicted; the caller is never told about slow consumers.
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> BroadcastReport {
        let payload = payload.into();
        let mut doomed = Vec::new();
        let mut delivered = 0;

        let mut registry = self.registry.lock();
        for (id, subscriber) in registry.iter() {
            if !subscriber.conn.is_alive(self.liveness_window) {
                doomed.push((*id, EvictionReason::Dead));
                continue;
            }
            match subscriber.tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => doomed.push((*id, EvictionReason::SlowConsumer)),
                Err(TrySendError::Closed(_)) => doomed.push((*id, EvictionReason::Disconnected)),
            }
        }
        let evicted = Self::remove_locked(&mut registry, doomed);
        let count = registry.len();
        drop(registry);

        self.messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::counter!(HUB_MESSAGES_SENT_TOTAL).increment(delivered as u64);
        let evicted_count = self.finish_eviction(evicted, count);

        BroadcastReport {
            delivered,
            evicted: evicted_count,
        }
    }

    /// Evict every Dead or disconnected connection without broadcasting.
    pub fn evict_dead(&self) -> usize {
        let mut registry = self.registry.lock();
        let doomed: Vec<_> = registry
            .iter()
            .filter_map(|(id, subscriber)| {
                if subscriber.tx.is_closed() {
                    Some((*id, EvictionReason::Disconnected))
                } else if !subscriber.conn.is_alive(self.liveness_window) {
                    Some((*id, EvictionReason::Dead))
                } else {
                    None
                }
            })
            .collect();
        let evicted = Self::remove_locked(&mut registry, doomed);
        let count = registry.len();
        drop(registry);

        self.finish_eviction(evicted, count)
    }

    /// Sweep Dead connections every `interval` until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = hub.evict_dead();
                        if evicted > 0 {
                            debug!(evicted, "reaper evicted dead connections");
                        }
                    }
                }
            }
        })
    }

    /// Unregister every connection, closing all queues. Later registrations
    /// are refused.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Subscriber> = {
            let mut registry = self.registry.lock();
            self.closed.store(true, Ordering::Release);
            registry.drain().map(|(_, subscriber)| subscriber).collect()
        };
        let count = drained.len();
        for subscriber in drained {
            subscriber.conn.mark_closed();
        }
        metrics::gauge!(HUB_CONNECTIONS).set(0.0);
        info!(connections = count, "Broadcast hub shut down");
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            messages_sent: self.messages_sent(),
            evictions: self.evictions.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }

    fn remove_locked(
        registry: &mut HashMap<ConnectionId, Subscriber>,
        doomed: Vec<(ConnectionId, EvictionReason)>,
    ) -> Vec<(Subscriber, EvictionReason)> {
        doomed
            .into_iter()
            .filter_map(|(id, reason)| registry.remove(&id).map(|s| (s, reason)))
            .collect()
    }

    /// Close the queues of subscribers already removed from the registry.
    fn finish_eviction(&self, evicted: Vec<(Subscriber, EvictionReason)>, remaining: usize) -> usize {
        let count = evicted.len();
        if count == 0 {
            return 0;
        }

        for (subscriber, reason) in evicted {
            subscriber.conn.mark_closed();
            metrics::counter!(HUB_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
            debug!(
                connection_id = %subscriber.conn.id(),
                subscriber = %subscriber.conn.subscriber_id(),
                reason = reason.as_str(),
                "connection evicted"
            );
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        metrics::gauge!(HUB_CONNECTIONS).set(remaining as f64);
        count
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_policy(&HeartbeatPolicy::default())
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("connections", &self.connection_count())
            .field("liveness_window", &self.liveness_window)
            .finish_non_exhaustive()
    }
}
