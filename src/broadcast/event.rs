//! Broadcast events and the wire frames exchanged with clients.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::entities::ContentItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A content change retained in the backlog. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Process-wide sequence number, strictly increasing in broadcast order.
    pub seq: u64,
    pub kind: EventKind,
    pub item: ContentItem,
    /// Unix milliseconds, as sent to clients.
    pub timestamp: i64,
    pub(crate) recorded_at: Instant,
}

impl BroadcastEvent {
    pub fn to_message(&self) -> ServerMessage {
        let data = self.item.clone();
        let timestamp = self.timestamp;
        match self.kind {
            EventKind::Created => ServerMessage::Created { data, timestamp },
            EventKind::Updated => ServerMessage::Updated { data, timestamp },
            EventKind::Deleted => ServerMessage::Deleted { data, timestamp },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeData {
    pub message: String,
    pub connection_id: String,
}

/// Frames sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Created { data: ContentItem, timestamp: i64 },
    Updated { data: ContentItem, timestamp: i64 },
    Deleted { data: ContentItem, timestamp: i64 },
    Welcome { data: WelcomeData, timestamp: i64 },
    Heartbeat { timestamp: i64 },
    Pong { timestamp: i64 },
    /// Backlog replay for a newly connected client, oldest first.
    RecentMessages { data: Vec<ContentItem>, timestamp: i64 },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
            Self::Welcome { .. } => "welcome",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Pong { .. } => "pong",
            Self::RecentMessages { .. } => "recent_messages",
        }
    }
}

/// Frames a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Answer to a server heartbeat.
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
