//! Push-channel synchronization: wire frames, room membership and the
//! conversation index fed by `new_message` pushes.

pub mod connection;
pub mod index;
pub mod realtime;
pub mod reducer;

use crate::models::{timestamp, Message, MessageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use index::ConversationIndex;
pub use realtime::RealtimeSyncClient;

/// Client to server frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { room: String },
    Leave { room: String },
}

/// Server to client frame envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct ServerFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerFrame {
    /// The `new_message` payload, `None` for any other event.
    pub(crate) fn into_new_message(self) -> Result<Option<NewMessage>, serde_json::Error> {
        match self.event.as_str() {
            "new_message" => serde_json::from_value(self.data).map(Some),
            _ => Ok(None),
        }
    }
}

/// Payload of a `new_message` push.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(alias = "sent_at", with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
}

impl From<NewMessage> for Message {
    fn from(push: NewMessage) -> Self {
        Message {
            id: push.id,
            conversation_id: Some(push.conversation_id),
            sender_id: Some(push.sender_id),
            role: None,
            kind: Some(push.kind),
            content: push.content,
            attachments: Default::default(),
            media_url: push.media_url,
            reference_id: push.reference_id,
            created_at: push.created_at,
        }
    }
}

/// Items of the inbound push queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// The socket is up. `reconnect` is false only for the first connection.
    Connected { reconnect: bool },
    Disconnected,
    NewMessage(NewMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Invalid header: {0}")]
    Header(String),
    #[error("Push channel closed")]
    Closed,
}
