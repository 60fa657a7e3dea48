use crate::models::{Message, Role, SessionStatus};
use crate::stream::{ChatRequest, ProtocolEvent, StreamDecoder, StreamError};
use crate::sync::reducer;
use tracing::{debug, info, warn};

/// Follow-up work a stream event asks of the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// The session was just bound to a conversation; reload the assistant
    /// conversation list once.
    RefreshConversations,
}

/// One chat view: its message list and at most one in-flight assistant stream.
///
/// `Idle -> Sending -> Streaming -> Idle`, or `Error` after a failed
/// attempt. `Error` accepts a new send like `Idle`.
#[derive(Debug)]
pub struct ChatSessionController {
    user_id: String,
    status: SessionStatus,
    conversation_id: Option<String>,
    messages: Vec<Message>,
    placeholder: Option<usize>,
    decoder: StreamDecoder,
    refreshed: bool,
}

impl ChatSessionController {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: SessionStatus::Idle,
            conversation_id: None,
            messages: Vec::new(),
            placeholder: None,
            decoder: StreamDecoder::new(),
            refreshed: false,
        }
    }

    /// A session already bound to an existing conversation.
    pub fn for_conversation(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            refreshed: true,
            ..Self::new(user_id)
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.status, SessionStatus::Sending | SessionStatus::Streaming)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Starts a send. Returns the request to issue, or `None` when the text
    /// is blank or a stream is already outstanding. Nothing is queued.
    pub fn begin_send(&mut self, text: &str) -> Option<ChatRequest> {
        if self.is_busy() {
            warn!(status = ?self.status, "send rejected, a stream is already in flight");
            return None;
        }
        if text.trim().is_empty() {
            return None;
        }

        self.messages.push(Message::local(
            Role::User,
            self.conversation_id.clone(),
            text,
        ));
        self.status = SessionStatus::Sending;
        Some(ChatRequest {
            user_id: self.user_id.clone(),
            message: text.to_string(),
            conversation_id: self.conversation_id.clone(),
        })
    }

    /// The response arrived; add the empty assistant message chunks fill in.
    pub fn stream_opened(&mut self) {
        if self.status != SessionStatus::Sending {
            return;
        }
        self.messages.push(Message::local(
            Role::Assistant,
            self.conversation_id.clone(),
            "",
        ));
        self.placeholder = Some(self.messages.len() - 1);
        self.decoder = StreamDecoder::new();
        self.status = SessionStatus::Streaming;
    }

    /// Decodes one body chunk and applies every completed event in order.
    pub fn receive_chunk(&mut self, chunk: &[u8]) -> Vec<SessionEffect> {
        if self.status != SessionStatus::Streaming {
            return Vec::new();
        }
        let events = self.decoder.push(chunk);
        events
            .into_iter()
            .filter_map(|event| self.apply_event(event))
            .collect()
    }

    pub fn apply_event(&mut self, event: ProtocolEvent) -> Option<SessionEffect> {
        match event {
            ProtocolEvent::Init { conversation_id } => {
                match reducer::apply_init(self.conversation_id.as_deref(), &conversation_id) {
                    Ok(Some(bound)) => {
                        info!(conversation_id = %bound, "session bound to conversation");
                        for message in &mut self.messages {
                            message.conversation_id.get_or_insert_with(|| bound.clone());
                        }
                        self.conversation_id = Some(bound);
                        if !self.refreshed {
                            self.refreshed = true;
                            return Some(SessionEffect::RefreshConversations);
                        }
                    }
                    Ok(None) => {}
                    Err(violation) => warn!(%violation, "protocol violation, keeping binding"),
                }
            }
            ProtocolEvent::TextChunk { delta } => {
                self.update_placeholder(|message| reducer::apply_text_chunk(message, &delta));
            }
            ProtocolEvent::Attachment(attachment) => {
                self.update_placeholder(|message| reducer::apply_attachment(message, attachment));
            }
            ProtocolEvent::MessageEnd { full_text } => {
                let streamed = self
                    .placeholder
                    .and_then(|i| self.messages.get(i))
                    .map(|m| m.content.len());
                if streamed != Some(full_text.len()) {
                    debug!(streamed = ?streamed, full = full_text.len(), "message_end text differs from streamed text");
                }
            }
            ProtocolEvent::Unknown { event, .. } => {
                debug!(event = %event, "ignoring unknown stream event");
            }
        }
        None
    }

    /// Normal end of body. The assistant message becomes final.
    pub fn finish_stream(&mut self) -> Vec<SessionEffect> {
        if self.status != SessionStatus::Streaming {
            return Vec::new();
        }
        let effects = self
            .decoder
            .finish()
            .into_iter()
            .filter_map(|event| self.apply_event(event))
            .collect();
        self.placeholder = None;
        self.status = SessionStatus::Idle;
        effects
    }

    /// Transport failure. Streamed content stays; one system message is added.
    pub fn fail_stream(&mut self, error: &StreamError) {
        if !self.is_busy() {
            return;
        }
        warn!(error = %error, "assistant stream failed");
        self.decoder.finish();
        self.placeholder = None;
        self.messages.push(Message::local(
            Role::System,
            self.conversation_id.clone(),
            format!("Error: Could not connect to AI service. ({})", error),
        ));
        self.status = SessionStatus::Error;
    }

    /// Abandons the in-flight stream and drops its placeholder silently.
    pub fn cancel(&mut self) {
        if !self.is_busy() {
            return;
        }
        if let Some(index) = self.placeholder.take() {
            self.messages.remove(index);
        }
        self.decoder.finish();
        self.status = SessionStatus::Idle;
        debug!("assistant stream cancelled");
    }

    /// Replaces the list with a stored history snapshot, keeping shown
    /// messages it lacks. Ignored while a stream is in flight.
    pub fn load_history(&mut self, history: Vec<Message>) {
        if self.is_busy() {
            debug!("history arrived during a stream, skipping");
            return;
        }
        let displayed = std::mem::take(&mut self.messages);
        self.messages = reducer::apply_history(displayed, history);
    }

    fn update_placeholder(&mut self, apply: impl FnOnce(Message) -> Message) {
        let Some(index) = self.placeholder else {
            warn!("stream event with no assistant message in flight");
            return;
        };
        let message = std::mem::take(&mut self.messages[index]);
        self.messages[index] = apply(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;

    const SCENARIO: &[u8] = b"event: init\ndata: {\"conversation_id\":\"c1\"}\n\n\
event: text_chunk\ndata: {\"delta\":\"Hi\"}\n\n\
event: text_chunk\ndata: {\"delta\":\" there\"}\n\n";

    fn streaming(session: &mut ChatSessionController, text: &str) -> ChatRequest {
        let request = session.begin_send(text).expect("send accepted");
        session.stream_opened();
        request
    }

    #[test]
    fn end_to_end_over_ten_chunkings() {
        for pieces in 1..=10 {
            let mut session = ChatSessionController::new("u1");
            let request = streaming(&mut session, "Where should I go?");
            assert_eq!(request.conversation_id, None);
            assert_eq!(session.status(), SessionStatus::Streaming);

            let size = SCENARIO.len().div_ceil(pieces);
            let mut effects = Vec::new();
            for chunk in SCENARIO.chunks(size) {
                effects.extend(session.receive_chunk(chunk));
            }
            effects.extend(session.finish_stream());

            assert_eq!(effects, vec![SessionEffect::RefreshConversations]);
            assert_eq!(session.status(), SessionStatus::Idle);
            assert_eq!(session.conversation_id(), Some("c1"));
            let messages = session.messages();
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].role, Some(Role::User));
            assert_eq!(messages[0].conversation_id.as_deref(), Some("c1"));
            assert_eq!(messages[1].role, Some(Role::Assistant));
            assert_eq!(messages[1].content, "Hi there");
        }
    }

    #[test]
    fn finalized_message_ignores_late_chunks() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "hi");
        session.receive_chunk(b"event: text_chunk\ndata: {\"delta\":\"done\"}\n\n");
        session.finish_stream();
        session.receive_chunk(b"event: text_chunk\ndata: {\"delta\":\"late\"}\n\n");
        session.apply_event(ProtocolEvent::TextChunk { delta: "later".into() });
        assert_eq!(session.messages()[1].content, "done");
    }

    #[test]
    fn concurrent_send_is_rejected() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "first");
        assert!(session.begin_send("second").is_none());
        assert_eq!(session.messages().len(), 2);
        assert!(session.begin_send("   ").is_none());
    }

    #[test]
    fn second_turn_sends_bound_conversation() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "one");
        session.receive_chunk(b"event: init\ndata: {\"conversation_id\":\"c9\"}\n\n");
        session.finish_stream();

        let request = session.begin_send("two").unwrap();
        assert_eq!(request.conversation_id.as_deref(), Some("c9"));
    }

    #[test]
    fn rebinding_init_keeps_first_conversation() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "hi");
        let effects = session.receive_chunk(
            b"event: init\ndata: {\"conversation_id\":\"c1\"}\n\n\
event: init\ndata: {\"conversation_id\":\"c2\"}\n\n\
event: text_chunk\ndata: {\"delta\":\"still here\"}\n\n",
        );
        assert_eq!(effects, vec![SessionEffect::RefreshConversations]);
        assert_eq!(session.conversation_id(), Some("c1"));
        assert_eq!(session.messages()[1].content, "still here");
    }

    #[test]
    fn duplicate_attachments_collapse() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "ideas?");
        session.receive_chunk(
            b"event: attachment\ndata: {\"reference_id\":\"t1\",\"type\":\"trip\",\"title\":\"Alps\"}\n\n\
event: attachment\ndata: {\"reference_id\":\"t1\",\"type\":\"trip\",\"title\":\"Alps again\"}\n\n",
        );
        session.finish_stream();
        let attachments: Vec<&Attachment> = session.messages()[1].attachments.iter().collect();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].title, "Alps");
    }

    #[test]
    fn transport_error_adds_one_system_message_and_keeps_partial_text() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "hi");
        session.receive_chunk(b"event: text_chunk\ndata: {\"delta\":\"partial\"}\n\n");
        let error = StreamError::Decode("connection reset".into());
        session.fail_stream(&error);
        session.fail_stream(&error);

        assert_eq!(session.status(), SessionStatus::Error);
        let messages = session.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "partial");
        assert_eq!(messages[2].role, Some(Role::System));
        assert!(session.begin_send("retry by hand").is_some());
    }

    #[test]
    fn failure_before_response_has_no_placeholder() {
        let mut session = ChatSessionController::new("u1");
        session.begin_send("hi").unwrap();
        session.fail_stream(&StreamError::Api {
            status: 500,
            message: "boom".into(),
        });
        let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Some(Role::User), Some(Role::System)]);
    }

    #[test]
    fn cancel_discards_placeholder_without_system_message() {
        let mut session = ChatSessionController::new("u1");
        streaming(&mut session, "hi");
        session.receive_chunk(b"event: text_chunk\ndata: {\"delta\":\"half\"}\n\n");
        session.cancel();

        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Some(Role::User));
    }

    #[test]
    fn history_reload_is_idempotent() {
        let stored = |id: &str, content: &str| {
            let mut message = Message::local(Role::Assistant, Some("ai-1".into()), content);
            message.id = id.into();
            message
        };
        let mut session = ChatSessionController::for_conversation("u1", "ai-1");
        session.load_history(vec![stored("ai-1-0", "old")]);
        session.load_history(vec![stored("ai-1-0", "old"), stored("ai-1-1", "newer")]);

        let ids: Vec<_> = session.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["ai-1-0", "ai-1-1"]);
    }

    #[test]
    fn history_is_skipped_while_streaming() {
        let mut session = ChatSessionController::for_conversation("u1", "ai-1");
        streaming(&mut session, "hi");
        session.load_history(Vec::new());
        assert_eq!(session.messages().len(), 2);
    }
}
