//! Single owner of the assistant chat session, the focused peer room and the
//! conversation indexes.
//!
//! Commands from the UI, pushes from the connection, reload results and the
//! active assistant stream all arrive on one task and are applied in arrival
//! order, so no state is shared or mirrored between callbacks.
//!
//! The assistant session and the peer room are separate views: focusing a
//! room never rebinds the assistant session, and pushes never touch it.

use super::{ChatSessionController, SessionEffect};
use crate::api::{AiConversation, ApiError, SocialApi};
use crate::models::{ConversationPreview, Message, SessionStatus};
use crate::stream::client::ByteStream;
use crate::stream::{AssistantClient, StreamError};
use crate::sync::{reducer, ClientFrame, ConversationIndex, PushEvent, RealtimeSyncClient, SyncError};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Sends a message to the assistant session.
    Send(String),
    /// Opens a stored assistant conversation and loads its history.
    OpenAssistant(String),
    /// Starts an unbound assistant session.
    NewAssistantChat,
    /// Joins a peer room and loads its history.
    Focus(String),
    Unfocus,
    Cancel,
    ReloadConversations,
    LoadMessages,
    Shutdown,
}

/// Everything the UI renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewState {
    /// Assistant session status, bound conversation and messages.
    pub status: SessionStatus,
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub assistant_conversations: Vec<ConversationPreview>,
    /// Focused peer room and its messages.
    pub focused: Option<String>,
    pub room_messages: Vec<Message>,
    pub previews: Vec<ConversationPreview>,
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<ViewState>,
}

impl EngineHandle {
    pub fn send(&self, text: impl Into<String>) -> Result<(), SyncError> {
        self.command(EngineCommand::Send(text.into()))
    }

    pub fn open_assistant(&self, conversation_id: impl Into<String>) -> Result<(), SyncError> {
        self.command(EngineCommand::OpenAssistant(conversation_id.into()))
    }

    pub fn new_assistant_chat(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::NewAssistantChat)
    }

    pub fn focus(&self, conversation_id: impl Into<String>) -> Result<(), SyncError> {
        self.command(EngineCommand::Focus(conversation_id.into()))
    }

    pub fn unfocus(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::Unfocus)
    }

    pub fn cancel(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::Cancel)
    }

    pub fn reload_conversations(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::ReloadConversations)
    }

    /// Reloads the focused room's history, e.g. after a reconnect.
    pub fn load_messages(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::LoadMessages)
    }

    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.command(EngineCommand::Shutdown)
    }

    pub fn state(&self) -> ViewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `ready`.
    pub async fn wait_for(
        &self,
        ready: impl FnMut(&ViewState) -> bool,
    ) -> Result<ViewState, SyncError> {
        let mut state = self.state.clone();
        let view = state.wait_for(ready).await.map_err(|_| SyncError::Closed)?;
        Ok(view.clone())
    }

    fn command(&self, command: EngineCommand) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Closed)
    }
}

enum Inflight {
    Opening(BoxFuture<'static, Result<ByteStream, StreamError>>),
    Reading(ByteStream),
}

enum Step {
    Opened(Result<ByteStream, StreamError>),
    Chunk(Option<Result<Bytes, StreamError>>),
}

enum Reloaded {
    Conversations(Result<Vec<ConversationPreview>, ApiError>),
    AssistantConversations(Result<Vec<ConversationPreview>, ApiError>),
    RoomHistory {
        conversation_id: String,
        result: Result<Vec<Message>, ApiError>,
    },
    AssistantHistory {
        conversation_id: String,
        result: Result<AiConversation, ApiError>,
    },
}

pub struct ChatEngine {
    user_id: String,
    session: ChatSessionController,
    realtime: RealtimeSyncClient,
    room_messages: Vec<Message>,
    index: ConversationIndex,
    assistant_index: ConversationIndex,
    assistant: AssistantClient,
    api: SocialApi,
    inflight: Option<Inflight>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    pushes: mpsc::UnboundedReceiver<PushEvent>,
    reload_tx: mpsc::UnboundedSender<Reloaded>,
    reloads: mpsc::UnboundedReceiver<Reloaded>,
    state: watch::Sender<ViewState>,
}

impl ChatEngine {
    pub fn new(
        user_id: impl Into<String>,
        assistant: AssistantClient,
        api: SocialApi,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        pushes: mpsc::UnboundedReceiver<PushEvent>,
    ) -> (Self, EngineHandle) {
        let user_id = user_id.into();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (reload_tx, reloads) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ViewState::default());

        let engine = Self {
            session: ChatSessionController::new(user_id.clone()),
            realtime: RealtimeSyncClient::new(user_id.clone(), outbound),
            user_id,
            room_messages: Vec::new(),
            index: ConversationIndex::new(),
            assistant_index: ConversationIndex::new(),
            assistant,
            api,
            inflight: None,
            commands,
            pushes,
            reload_tx,
            reloads,
            state: state_tx,
        };
        let handle = EngineHandle {
            commands: command_tx,
            state: state_rx,
        };
        (engine, handle)
    }

    pub async fn run(mut self) {
        info!("chat engine started");
        self.reload_conversations();
        self.reload_assistant_conversations();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.pushes.recv() => self.handle_push(event),
                Some(reloaded) = self.reloads.recv() => self.handle_reload(reloaded),
                step = next_step(&mut self.inflight) => self.handle_step(step),
            }
            self.publish();
        }

        self.cancel_stream();
        self.realtime.unfocus();
        self.publish();
        info!("chat engine stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        debug!(?command, "engine command");
        match command {
            EngineCommand::Send(text) => {
                if let Some(request) = self.session.begin_send(&text) {
                    let assistant = self.assistant.clone();
                    self.inflight = Some(Inflight::Opening(Box::pin(async move {
                        assistant.open(&request).await
                    })));
                }
            }
            EngineCommand::OpenAssistant(conversation_id) => {
                if self.session.conversation_id() == Some(conversation_id.as_str()) {
                    return;
                }
                self.cancel_stream();
                self.session =
                    ChatSessionController::for_conversation(self.user_id.clone(), conversation_id.clone());
                self.load_assistant_history(conversation_id);
            }
            EngineCommand::NewAssistantChat => {
                self.cancel_stream();
                self.session = ChatSessionController::new(self.user_id.clone());
            }
            EngineCommand::Focus(conversation_id) => {
                if self.realtime.focused() == Some(conversation_id.as_str()) {
                    return;
                }
                self.realtime.focus(&conversation_id);
                self.room_messages.clear();
                self.index.mark_read(&conversation_id);
                self.load_room_history(conversation_id);
            }
            EngineCommand::Unfocus => {
                self.realtime.unfocus();
                self.room_messages.clear();
            }
            EngineCommand::Cancel => self.cancel_stream(),
            EngineCommand::ReloadConversations => {
                self.reload_conversations();
                self.reload_assistant_conversations();
            }
            EngineCommand::LoadMessages => match self.realtime.focused() {
                Some(focused) => self.load_room_history(focused.to_string()),
                None => debug!("no focused room to reload"),
            },
            EngineCommand::Shutdown => {}
        }
    }

    fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Connected { reconnect } => {
                if reconnect {
                    info!("push channel reconnected; pushes sent while offline are not replayed");
                }
            }
            PushEvent::Disconnected => warn!("push channel disconnected"),
            PushEvent::NewMessage(push) => {
                self.realtime
                    .on_new_message(push.into(), &mut self.index, &mut self.room_messages);
            }
        }
    }

    fn handle_reload(&mut self, reloaded: Reloaded) {
        match reloaded {
            Reloaded::Conversations(Ok(previews)) => {
                debug!(count = previews.len(), "conversation list reloaded");
                self.index.replace_all(previews);
                if let Some(focused) = self.realtime.focused() {
                    self.index.mark_read(focused);
                }
            }
            Reloaded::AssistantConversations(Ok(previews)) => {
                debug!(count = previews.len(), "assistant conversation list reloaded");
                self.assistant_index.replace_all(previews);
            }
            Reloaded::Conversations(Err(e)) | Reloaded::AssistantConversations(Err(e)) => {
                warn!(error = %e, "conversation list reload failed");
            }
            Reloaded::RoomHistory {
                conversation_id,
                result: Ok(history),
            } => {
                if self.realtime.focused() == Some(conversation_id.as_str()) {
                    let displayed = std::mem::take(&mut self.room_messages);
                    self.room_messages = reducer::apply_history(displayed, history);
                } else {
                    debug!(conversation_id = %conversation_id, "history for unfocused room dropped");
                }
            }
            Reloaded::AssistantHistory {
                conversation_id,
                result: Ok(conversation),
            } => {
                if self.session.conversation_id() == Some(conversation_id.as_str()) {
                    self.session.load_history(conversation.messages);
                } else {
                    debug!(conversation_id = %conversation_id, "history for closed assistant conversation dropped");
                }
            }
            Reloaded::RoomHistory {
                conversation_id,
                result: Err(e),
            }
            | Reloaded::AssistantHistory {
                conversation_id,
                result: Err(e),
            } => {
                warn!(conversation_id = %conversation_id, error = %e, "history load failed");
            }
        }
    }

    fn handle_step(&mut self, step: Step) {
        match step {
            Step::Opened(Ok(stream)) => {
                self.session.stream_opened();
                self.inflight = Some(Inflight::Reading(stream));
            }
            Step::Opened(Err(e)) | Step::Chunk(Some(Err(e))) => {
                self.inflight = None;
                self.session.fail_stream(&e);
            }
            Step::Chunk(Some(Ok(chunk))) => {
                let effects = self.session.receive_chunk(&chunk);
                self.apply_effects(effects);
            }
            Step::Chunk(None) => {
                self.inflight = None;
                let effects = self.session.finish_stream();
                self.apply_effects(effects);
            }
        }
    }

    fn apply_effects(&mut self, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::RefreshConversations => self.reload_assistant_conversations(),
            }
        }
    }

    /// Drops the active body reader without draining it.
    fn cancel_stream(&mut self) {
        if self.inflight.take().is_some() {
            self.session.cancel();
        }
    }

    fn reload_conversations(&self) {
        let api = self.api.clone();
        let tx = self.reload_tx.clone();
        tokio::spawn(async move {
            let result = api.list_conversations().await;
            let _ = tx.send(Reloaded::Conversations(result));
        });
    }

    fn reload_assistant_conversations(&self) {
        let api = self.api.clone();
        let user_id = self.user_id.clone();
        let tx = self.reload_tx.clone();
        tokio::spawn(async move {
            let result = api.list_ai_conversations(&user_id).await;
            let _ = tx.send(Reloaded::AssistantConversations(result));
        });
    }

    fn load_room_history(&self, conversation_id: String) {
        let api = self.api.clone();
        let tx = self.reload_tx.clone();
        tokio::spawn(async move {
            let result = api.messages(&conversation_id).await;
            let _ = tx.send(Reloaded::RoomHistory {
                conversation_id,
                result,
            });
        });
    }

    fn load_assistant_history(&self, conversation_id: String) {
        let api = self.api.clone();
        let user_id = self.user_id.clone();
        let tx = self.reload_tx.clone();
        tokio::spawn(async move {
            let result = api.ai_conversation(&conversation_id, &user_id).await;
            let _ = tx.send(Reloaded::AssistantHistory {
                conversation_id,
                result,
            });
        });
    }

    fn publish(&self) {
        let next = ViewState {
            status: self.session.status(),
            conversation_id: self.session.conversation_id().map(str::to_string),
            messages: self.session.messages().to_vec(),
            assistant_conversations: self.assistant_index.list(),
            focused: self.realtime.focused().map(str::to_string),
            room_messages: self.room_messages.clone(),
            previews: self.index.list(),
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn next_step(inflight: &mut Option<Inflight>) -> Step {
    match inflight {
        Some(Inflight::Opening(opening)) => Step::Opened(opening.await),
        Some(Inflight::Reading(stream)) => Step::Chunk(stream.next().await),
        None => std::future::pending().await,
    }
}
