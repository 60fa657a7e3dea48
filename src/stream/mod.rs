pub mod client;
pub mod decoder;

use crate::models::Attachment;
use serde::{Deserialize, Serialize};

pub use client::AssistantClient;
pub use decoder::StreamDecoder;

/// Body of the assistant chat request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// One decoded frame of the assistant stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Init { conversation_id: String },
    TextChunk { delta: String },
    Attachment(Attachment),
    MessageEnd { full_text: String },
    /// Any other `event:` type, handed through with its raw payload.
    Unknown {
        event: String,
        data: serde_json::Value,
    },
}

#[derive(Deserialize)]
struct InitPayload {
    conversation_id: String,
}

#[derive(Deserialize)]
struct TextChunkPayload {
    delta: String,
}

#[derive(Deserialize)]
struct MessageEndPayload {
    #[serde(default)]
    full_text: String,
}

impl ProtocolEvent {
    /// Builds a typed event from the frame's `event:` name and parsed `data:` JSON.
    pub fn from_frame(event: &str, data: serde_json::Value) -> Result<Self, StreamError> {
        let decoded = match event {
            "init" => serde_json::from_value::<InitPayload>(data).map(|p| ProtocolEvent::Init {
                conversation_id: p.conversation_id,
            }),
            "text_chunk" => serde_json::from_value::<TextChunkPayload>(data)
                .map(|p| ProtocolEvent::TextChunk { delta: p.delta }),
            "attachment" => serde_json::from_value::<Attachment>(data).map(ProtocolEvent::Attachment),
            "message_end" => serde_json::from_value::<MessageEndPayload>(data).map(|p| {
                ProtocolEvent::MessageEnd {
                    full_text: p.full_text,
                }
            }),
            other => {
                return Ok(ProtocolEvent::Unknown {
                    event: other.to_string(),
                    data,
                })
            }
        };
        decoded.map_err(|e| StreamError::Decode(format!("{event}: {e}")))
    }

    pub fn name(&self) -> &str {
        match self {
            ProtocolEvent::Init { .. } => "init",
            ProtocolEvent::TextChunk { .. } => "text_chunk",
            ProtocolEvent::Attachment(_) => "attachment",
            ProtocolEvent::MessageEnd { .. } => "message_end",
            ProtocolEvent::Unknown { event, .. } => event,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Decode error: {0}")]
    Decode(String),
}

impl Serialize for StreamError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
