pub mod api;
pub mod chat;
pub mod config;
pub mod models;
pub mod stream;
pub mod sync;

use chat::{ChatEngine, EngineHandle, ViewState};
use config::{ConfigError, Settings};
use models::{Role, SessionStatus};
use std::collections::HashSet;
use stream::AssistantClient;
use sync::connection::PushConnection;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("trip_chat_lib=info,trip_chat=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Spawns the push connection and the chat engine on the current runtime.
pub fn start(settings: &Settings) -> EngineHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (push_tx, push_rx) = mpsc::unbounded_channel();

    PushConnection::new(settings.push_url.clone(), settings.auth_token.clone())
        .spawn(outbound_rx, push_tx);

    let (engine, handle) = ChatEngine::new(
        settings.user_id.clone(),
        AssistantClient::new(&settings.api_base_url, settings.auth_token.clone()),
        api::SocialApi::new(&settings.api_base_url, settings.auth_token.clone()),
        outbound_tx,
        push_rx,
    );
    tokio::spawn(engine.run());
    handle
}

/// Line-oriented client: plain lines go to the assistant. `/ai <id>` and
/// `/new` pick the assistant conversation, `/focus <id>` and `/unfocus` the
/// peer room; `/cancel`, `/reload`, `/history` and `/quit` drive the engine.
pub fn run() -> Result<(), AppError> {
    init_tracing();
    let settings = Settings::from_env()?;
    info!(settings = ?settings.display_map(), "starting trip chat");

    // Everything runs on one thread; the engine task serializes all updates.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let handle = start(&settings);
        let printer = tokio::spawn(print_updates(handle.clone()));

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            let sent = match line.split_once(' ').unwrap_or((line, "")) {
                ("/quit", _) => break,
                ("/ai", id) if !id.trim().is_empty() => handle.open_assistant(id.trim()),
                ("/new", _) => handle.new_assistant_chat(),
                ("/focus", id) if !id.trim().is_empty() => handle.focus(id.trim()),
                ("/unfocus", _) => handle.unfocus(),
                ("/cancel", _) => handle.cancel(),
                ("/reload", _) => handle.reload_conversations(),
                ("/history", _) => handle.load_messages(),
                _ => handle.send(line),
            };
            if let Err(e) = sent {
                error!(error = %e, "engine is gone");
                break;
            }
        }

        let _ = handle.shutdown();
        printer.abort();
        Ok::<(), AppError>(())
    })
}

async fn print_updates(handle: EngineHandle) {
    let mut updates = handle.subscribe();
    let mut printed = HashSet::new();
    let mut shown = ViewState::default();
    while updates.changed().await.is_ok() {
        let view = updates.borrow_and_update().clone();
        if view.status != shown.status {
            println!("[{:?}]", view.status);
        }
        let streaming = view.status == SessionStatus::Streaming;
        let assistant = view
            .messages
            .iter()
            .filter(|m| !(streaming && m.role == Some(Role::Assistant)));
        for message in assistant.chain(&view.room_messages) {
            if printed.insert(message.id.clone()) {
                let who = match message.role {
                    Some(role) => format!("{:?}", role).to_lowercase(),
                    None => message.sender_id.clone().unwrap_or_default(),
                };
                println!("{}: {}", who, message.content);
            }
        }
        if view.assistant_conversations != shown.assistant_conversations {
            for preview in &view.assistant_conversations {
                println!("  ai {} {}", preview.id, preview.title);
            }
        }
        if view.previews != shown.previews {
            for preview in &view.previews {
                println!("  - {} {} (unread {})", preview.id, preview.title, preview.unread_count);
            }
        }
        shown = view;
    }
}
