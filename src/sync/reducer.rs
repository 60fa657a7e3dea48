//! Merge functions shared by the assistant stream and the push channel.
//!
//! Each takes its state by value and returns the next state. Duplicate
//! message ids and stale preview timestamps are absorbed as no-ops, so
//! applying the same event twice has the effect of applying it once.

use crate::models::{Attachment, ConversationPreview, LastMessage, Message};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("init tried to rebind conversation {current} to {attempted}")]
    Rebind { current: String, attempted: String },
}

/// Binds a session to `conversation_id`.
///
/// Returns the new binding, `None` if the session is already bound to the
/// same id, or a violation if it is bound elsewhere. The prior binding wins.
pub fn apply_init(
    bound: Option<&str>,
    conversation_id: &str,
) -> Result<Option<String>, ProtocolViolation> {
    match bound {
        None => Ok(Some(conversation_id.to_string())),
        Some(current) if current == conversation_id => Ok(None),
        Some(current) => Err(ProtocolViolation::Rebind {
            current: current.to_string(),
            attempted: conversation_id.to_string(),
        }),
    }
}

pub fn apply_text_chunk(mut message: Message, delta: &str) -> Message {
    message.content.push_str(delta);
    message
}

pub fn apply_attachment(mut message: Message, attachment: Attachment) -> Message {
    message.attachments.insert(attachment);
    message
}

/// Appends `message` unless its id is already in the list. Order is merge
/// order, not `created_at` order.
pub fn apply_new_message(mut list: Vec<Message>, message: Message) -> Vec<Message> {
    if list.iter().all(|m| m.id != message.id) {
        list.push(message);
    }
    list
}

/// Replaces `displayed` with a history snapshot, then re-applies what was
/// displayed so messages that arrived before the snapshot are kept once.
pub fn apply_history(displayed: Vec<Message>, history: Vec<Message>) -> Vec<Message> {
    displayed.into_iter().fold(history, apply_new_message)
}

/// Whether an update stamped `at` would replace `current`.
pub fn supersedes(current: Option<&ConversationPreview>, at: DateTime<Utc>) -> bool {
    current.map_or(true, |preview| at > preview.updated_at)
}

/// Last-write-wins by timestamp. An id with no preview yet gets a bare one.
pub fn apply_preview_update(
    mut previews: HashMap<String, ConversationPreview>,
    conversation_id: &str,
    last_message: LastMessage,
) -> HashMap<String, ConversationPreview> {
    if !supersedes(previews.get(conversation_id), last_message.created_at) {
        return previews;
    }

    let updated_at = last_message.created_at;
    match previews.get_mut(conversation_id) {
        Some(preview) => {
            preview.updated_at = updated_at;
            preview.last_message = Some(last_message);
        }
        None => {
            previews.insert(
                conversation_id.to_string(),
                ConversationPreview {
                    id: conversation_id.to_string(),
                    title: String::new(),
                    last_message: Some(last_message),
                    updated_at,
                    unread_count: 0,
                },
            );
        }
    }
    previews
}
