//! Real-time fan-out hub for live push connections.
//!
//! # Architecture
//!
//! ```text
//!                    broadcast(payload)
//!                           │
//!              ┌────────────▼─────────────┐
//!              │   BroadcastHub registry   │  one mutex: register,
//!              │  id → (Connection, tx)    │  unregister, fan-out
//!              └──┬──────────┬─────────┬──┘
//!           try_send     try_send   try_send      (never blocks)
//!                 ▼          ▼         ▼
//!             [queue]    [queue]   [queue]         bounded per connection
//!                 │          │         │
//!            writer pump  writer    writer         transport-owned
//! ```
//!
//! # Connection states
//!
//! `Connecting → Registered → {Alive ↔ Dead} → Unregistered`
//!
//! The handshake is the transport's job. A registered connection is Alive
//! while its last inbound frame is younger than the liveness window, and
//! Dead after that. Dead connections, and connections whose queue is full,
//! are evicted by the next broadcast or sweep.
//!
//! The registry owns each connection's queue sender, so removing a
//! connection from the registry is what closes its queue. A connection in
//! the registry therefore always has an open queue, and the queue closes
//! exactly once.

mod connection;
mod registry;

pub use connection::{Connection, ConnectionId, HeartbeatPolicy, Outbound};
pub use registry::{BroadcastHub, BroadcastReport, EvictionReason, HubStats};
