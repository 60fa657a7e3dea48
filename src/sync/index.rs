use super::reducer;
use crate::models::{ConversationPreview, LastMessage};
use std::collections::HashMap;
use tracing::debug;

/// Conversation previews keyed by id, listed newest first.
#[derive(Debug, Default, Clone)]
pub struct ConversationIndex {
    previews: HashMap<String, ConversationPreview>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a pushed last message into the index. Returns whether the
    /// preview changed; replays and older updates return `false`.
    pub fn apply_push(&mut self, conversation_id: &str, last_message: LastMessage) -> bool {
        let accepted = reducer::supersedes(self.previews.get(conversation_id), last_message.created_at);
        let previews = std::mem::take(&mut self.previews);
        self.previews = reducer::apply_preview_update(previews, conversation_id, last_message);
        if !accepted {
            debug!(conversation_id, "stale preview update ignored");
        }
        accepted
    }

    /// Replaces the index with a reload snapshot. Entries already known with
    /// a newer `updated_at` keep their last message but take the snapshot's
    /// title and unread count. Conversations are never deleted here, so ids
    /// missing from the snapshot are kept as pushed.
    pub fn replace_all(&mut self, previews: Vec<ConversationPreview>) {
        let mut known = std::mem::take(&mut self.previews);
        for incoming in previews {
            let merged = match known.remove(&incoming.id) {
                Some(mut current) if current.updated_at > incoming.updated_at => {
                    debug!(conversation_id = %incoming.id, "reload older than pushed preview, keeping push");
                    current.title = incoming.title;
                    current.unread_count = incoming.unread_count;
                    current
                }
                _ => incoming,
            };
            self.previews.insert(merged.id.clone(), merged);
        }
        for (id, pushed) in known {
            debug!(conversation_id = %id, "keeping pushed conversation absent from reload");
            self.previews.insert(id, pushed);
        }
    }

    pub fn mark_unread(&mut self, conversation_id: &str) {
        if let Some(preview) = self.previews.get_mut(conversation_id) {
            preview.unread_count = preview.unread_count.saturating_add(1);
        }
    }

    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(preview) = self.previews.get_mut(conversation_id) {
            preview.unread_count = 0;
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationPreview> {
        self.previews.get(conversation_id)
    }

    pub fn len(&self) -> usize {
        self.previews.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previews.is_empty()
    }

    /// Previews ordered by `updated_at` descending, ties broken by id.
    pub fn list(&self) -> Vec<ConversationPreview> {
        let mut list: Vec<_> = self.previews.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        list
    }
}
