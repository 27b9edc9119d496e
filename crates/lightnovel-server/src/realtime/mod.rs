//! WebSocket push to connected readers.
//!
//! The hub itself lives in `lightnovel-core`; this module adapts it to axum:
//! one reader pump and one writer pump per socket, plus the typed messages
//! the server publishes.

pub mod messages;
pub mod websocket;

pub use messages::{
    MessageKind, NoticeLevel, Notifier, NovelUpdate, RealtimeMessage, SystemNotice, UpdateKind,
};
pub use websocket::{DEVICE_ID_HEADER, RealtimeSettings, ws_handler};
