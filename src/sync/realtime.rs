use super::{reducer, ClientFrame, ConversationIndex};
use crate::models::Message;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Room membership on the shared push connection.
///
/// At most one room is joined at a time, and every join is paired with
/// exactly one leave: on refocus, on `unfocus`, or when the client drops.
/// Re-joining after a reconnect is the connection's job.
#[derive(Debug)]
pub struct RealtimeSyncClient {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    joined: Option<String>,
    user_id: String,
}

impl RealtimeSyncClient {
    pub fn new(user_id: impl Into<String>, outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            outbound,
            joined: None,
            user_id: user_id.into(),
        }
    }

    pub fn focused(&self) -> Option<&str> {
        self.joined.as_deref()
    }

    pub fn focus(&mut self, conversation_id: &str) {
        if self.joined.as_deref() == Some(conversation_id) {
            return;
        }
        self.unfocus();
        info!(room = conversation_id, "joining room");
        self.emit(ClientFrame::Join {
            room: conversation_id.to_string(),
        });
        self.joined = Some(conversation_id.to_string());
    }

    pub fn unfocus(&mut self) {
        if let Some(room) = self.joined.take() {
            info!(room = %room, "leaving room");
            self.emit(ClientFrame::Leave { room });
        }
    }

    /// Folds one pushed message into the index and, when it belongs to the
    /// focused room, into the displayed list.
    pub fn on_new_message(
        &self,
        message: Message,
        index: &mut ConversationIndex,
        displayed: &mut Vec<Message>,
    ) {
        let Some(conversation_id) = message.conversation_id.clone() else {
            warn!(message_id = %message.id, "push without conversation id");
            return;
        };

        let focused = self.joined.as_deref() == Some(conversation_id.as_str());
        let accepted = index.apply_push(&conversation_id, message.preview());
        if accepted && !focused && !message.is_own(&self.user_id) {
            index.mark_unread(&conversation_id);
        }

        if focused {
            let list = std::mem::take(displayed);
            *displayed = reducer::apply_new_message(list, message);
        }
    }

    fn emit(&self, frame: ClientFrame) {
        if self.outbound.send(frame).is_err() {
            warn!("push connection is gone, dropping frame");
        }
    }
}

impl Drop for RealtimeSyncClient {
    fn drop(&mut self) {
        self.unfocus();
    }
}
