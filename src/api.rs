//! REST snapshots the sync core consumes: peer conversation lists and
//! histories, and the assistant's own conversation store.

use crate::models::{timestamp, Attachments, ConversationPreview, LastMessage, Message, Role};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct SocialApi {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

/// Conversation list record. The list endpoint has no `updated_at`; it is
/// derived from the last message when absent.
#[derive(Deserialize)]
struct PreviewRecord {
    id: String,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    unread_count: u32,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    last_message: Option<LastMessageRecord>,
}

#[derive(Deserialize)]
struct LastMessageRecord {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "created_at")]
    sent_at: Option<String>,
}

/// One stored assistant turn. The store keeps no message ids.
#[derive(Deserialize)]
struct AiMessageRecord {
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Attachments,
    #[serde(with = "timestamp")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AiConversationRecord {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    messages: Vec<AiMessageRecord>,
}

/// An assistant conversation with its full history.
#[derive(Debug, Clone, PartialEq)]
pub struct AiConversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl AiConversationRecord {
    fn into_conversation(self) -> AiConversation {
        let messages = self
            .messages
            .into_iter()
            .enumerate()
            .map(|(position, record)| Message {
                // Stable across reloads, so merging a reload is idempotent.
                id: format!("{}-{}", self.id, position),
                conversation_id: Some(self.id.clone()),
                role: Some(record.role),
                content: record.content,
                attachments: record.attachments,
                created_at: record.timestamp,
                ..Message::default()
            })
            .collect();
        AiConversation {
            title: self.title.unwrap_or_default(),
            id: self.id,
            messages,
        }
    }
}

impl PreviewRecord {
    fn into_preview(self) -> ConversationPreview {
        let last_message = self.last_message.and_then(|last| {
            let created_at = last.sent_at.as_deref().and_then(timestamp::parse)?;
            Some(LastMessage {
                content: last.content.unwrap_or_default(),
                created_at,
            })
        });
        let updated_at = self
            .updated_at
            .as_deref()
            .and_then(timestamp::parse)
            .or_else(|| last_message.as_ref().map(|last| last.created_at))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        ConversationPreview {
            id: self.id,
            title: self.title.unwrap_or_default(),
            last_message,
            updated_at,
            unread_count: self.unread_count,
        }
    }
}

impl SocialApi {
    pub fn new(api_base_url: &str, auth_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: api_base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationPreview>, ApiError> {
        let records: Vec<PreviewRecord> = self.get("/social/conversations", &[]).await?;
        Ok(records.into_iter().map(PreviewRecord::into_preview).collect())
    }

    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        let path = format!("/social/conversations/{}/messages", conversation_id);
        let mut messages: Vec<Message> = self.get(&path, &[]).await?;
        for message in &mut messages {
            message
                .conversation_id
                .get_or_insert_with(|| conversation_id.to_string());
        }
        Ok(messages)
    }

    /// The user's assistant conversations, `{id, title, updated_at}` records.
    pub async fn list_ai_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationPreview>, ApiError> {
        let records: Vec<PreviewRecord> = self
            .get("/ai/conversations", &[("user_id", user_id)])
            .await?;
        Ok(records.into_iter().map(PreviewRecord::into_preview).collect())
    }

    pub async fn ai_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<AiConversation, ApiError> {
        let path = format!("/ai/conversations/{}", conversation_id);
        let record: AiConversationRecord = self.get(&path, &[("user_id", user_id)]).await?;
        Ok(record.into_conversation())
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let mut req = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status,
                message: text,
            });
        }

        Ok(resp.json().await?)
    }
}
