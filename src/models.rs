use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Peer chat message kind as sent by the push channel and history endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    SharePost,
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub reference_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Attachments of one message, unique by `reference_id`, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Attachment>", into = "Vec<Attachment>")]
pub struct Attachments {
    items: Vec<Attachment>,
    keys: HashSet<String>,
}

impl Attachments {
    /// Inserts unless an attachment with the same `reference_id` is already
    /// present. Returns whether the set changed.
    pub fn insert(&mut self, attachment: Attachment) -> bool {
        if !self.keys.insert(attachment.reference_id.clone()) {
            return false;
        }
        self.items.push(attachment);
        true
    }

    pub fn contains(&self, reference_id: &str) -> bool {
        self.keys.contains(reference_id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attachment> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<Attachment>> for Attachments {
    fn from(items: Vec<Attachment>) -> Self {
        let mut attachments = Attachments::default();
        for item in items {
            attachments.insert(item);
        }
        attachments
    }
}

impl From<Attachments> for Vec<Attachment> {
    fn from(attachments: Attachments) -> Self {
        attachments.items
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Attachments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(alias = "sent_at", with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A locally created assistant-chat message with a fresh id.
    pub fn local(role: Role, conversation_id: Option<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            sender_id: None,
            role: Some(role),
            kind: None,
            content: content.into(),
            attachments: Attachments::default(),
            media_url: None,
            reference_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_own(&self, user_id: &str) -> bool {
        match self.role {
            Some(role) => role == Role::User,
            None => self.sender_id.as_deref() == Some(user_id),
        }
    }

    pub fn preview(&self) -> LastMessage {
        LastMessage {
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LastMessage {
    #[serde(default)]
    pub content: String,
    #[serde(alias = "sent_at", with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationPreview {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Sending,
    Streaming,
    Error,
}

/// ISO-8601 timestamps, with or without an offset. Naive values are UTC.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}
