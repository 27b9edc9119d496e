//! Push message envelopes and the broadcaster that serializes them.

use std::sync::Arc;

use lightnovel_core::{BroadcastHub, CoreError, hub::BroadcastReport};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Envelope for every frame pushed to clients:
/// `{"type": "...", "data": {...}, "time": "<RFC 3339>"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeMessage<T> {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: T,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

impl<T> RealtimeMessage<T> {
    pub fn new(kind: MessageKind, data: T) -> Self {
        Self {
            kind,
            data,
            time: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    NovelUpdate,
    SystemNotice,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    NewChapter,
    NewVolume,
    ContentUpdate,
    #[serde(other)]
    Other,
}

impl UpdateKind {
    pub fn describe(self, title: &str) -> String {
        match self {
            Self::NewChapter => format!("New chapter of \"{title}\" is out!"),
            Self::NewVolume => format!("A new volume of \"{title}\" has been released!"),
            Self::ContentUpdate => format!("\"{title}\" has been updated"),
            Self::Other => format!("\"{title}\" has news"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NovelUpdate {
    pub novel_id: String,
    pub title: String,
    pub update_type: UpdateKind,
    pub description: String,
}

impl NovelUpdate {
    pub fn new(novel_id: impl Into<String>, title: impl Into<String>, kind: UpdateKind) -> Self {
        let title = title.into();
        Self {
            novel_id: novel_id.into(),
            description: kind.describe(&title),
            title,
            update_type: kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemNotice {
    pub level: NoticeLevel,
    pub content: String,
}

/// Serializes typed messages and hands them to the hub.
#[derive(Clone, Debug)]
pub struct Notifier {
    hub: Arc<BroadcastHub>,
}

impl Notifier {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn novel_update(&self, update: NovelUpdate) -> Result<BroadcastReport, CoreError> {
        self.publish(&RealtimeMessage::new(MessageKind::NovelUpdate, update))
    }

    pub fn system_notice(
        &self,
        level: NoticeLevel,
        content: impl Into<String>,
    ) -> Result<BroadcastReport, CoreError> {
        let notice = SystemNotice {
            level,
            content: content.into(),
        };
        self.publish(&RealtimeMessage::new(MessageKind::SystemNotice, notice))
    }

    fn publish<T: Serialize>(&self, message: &RealtimeMessage<T>) -> Result<BroadcastReport, CoreError> {
        let payload = serde_json::to_vec(message)?;
        let report = self.hub.broadcast(payload);
        tracing::debug!(
            kind = ?message.kind,
            delivered = report.delivered,
            evicted = report.evicted,
            "realtime message broadcast"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightnovel_core::Connection;
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn novel_update_wire_shape() {
        let msg = RealtimeMessage::new(
            MessageKind::NovelUpdate,
            NovelUpdate::new("42", "Spice and Wolf", UpdateKind::NewVolume),
        );
        let json: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "novel_update");
        assert_eq!(json["data"]["novelId"], "42");
        assert_eq!(json["data"]["updateType"], "new_volume");
        assert!(json["data"]["description"].as_str().unwrap().contains("Spice and Wolf"));
        assert!(json["time"].is_string());
    }

    #[test]
    fn unknown_update_type_reads_as_other() {
        let kind: UpdateKind = serde_json::from_str("\"re_release\"").unwrap();
        assert_eq!(kind, UpdateKind::Other);
    }

    #[tokio::test]
    async fn notifier_reaches_registered_connections() {
        let hub = BroadcastHub::new_shared(Duration::from_secs(60));
        let (conn, mut outbound) = Connection::new("reader", 4);
        assert!(hub.register(&conn));

        let notifier = Notifier::new(hub.clone());
        let report = notifier
            .system_notice(NoticeLevel::Warning, "maintenance at 02:00")
            .unwrap();
        assert_eq!(report.delivered, 1);

        let frame = outbound.recv().await.unwrap();
        let msg: RealtimeMessage<SystemNotice> = serde_json::from_slice(&frame).unwrap();
        assert_eq!(msg.kind, MessageKind::SystemNotice);
        assert_eq!(msg.data.level, NoticeLevel::Warning);
        assert_eq!(msg.data.content, "maintenance at 02:00");
    }
}
