//! WebSocket transport for the push channel.
//!
//! One task owns the socket. Outbound [`ClientFrame`]s arrive on a queue and
//! inbound pushes are forwarded as [`PushEvent`]s. On failure the task
//! reconnects with exponential backoff. Frames queued while offline are not
//! replayed; the task tracks the room they leave joined and joins it once on
//! every new socket.

use super::{ClientFrame, PushEvent, ServerFrame, SyncError};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Reconnection backoff configuration.
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct PushConnection {
    url: String,
    auth_token: Option<String>,
}

/// The room the client wants to be in, as implied by the frames seen so far.
#[derive(Debug, Default)]
struct Membership {
    room: Option<String>,
}

impl Membership {
    fn track(&mut self, frame: &ClientFrame) {
        match frame {
            ClientFrame::Join { room } => self.room = Some(room.clone()),
            ClientFrame::Leave { room } => {
                if self.room.as_deref() == Some(room.as_str()) {
                    self.room = None;
                }
            }
        }
    }

    fn restore(&self) -> Option<ClientFrame> {
        self.room.clone().map(|room| ClientFrame::Join { room })
    }
}

/// Why a connected session ended.
enum Ended {
    Shutdown,
    Dropped,
}

impl PushConnection {
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            auth_token,
        }
    }

    /// Runs the connection until the outbound queue or the inbound receiver closes.
    pub fn spawn(
        self,
        outbound: mpsc::UnboundedReceiver<ClientFrame>,
        inbound: mpsc::UnboundedSender<PushEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(outbound, inbound))
    }

    async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
        inbound: mpsc::UnboundedSender<PushEvent>,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut reconnect = false;
        let mut membership = Membership::default();

        loop {
            match self.connect().await {
                Ok(socket) => {
                    info!(url = %self.url, reconnect, "push channel connected");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    // A fresh socket has no rooms; queued frames only move the target.
                    while let Ok(frame) = outbound.try_recv() {
                        membership.track(&frame);
                    }
                    if inbound.send(PushEvent::Connected { reconnect }).is_err() {
                        return;
                    }
                    reconnect = true;

                    match session(socket, &mut membership, &mut outbound, &inbound).await {
                        Ended::Shutdown => {
                            debug!("push channel shut down");
                            return;
                        }
                        Ended::Dropped => {
                            if inbound.send(PushEvent::Disconnected).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "push channel connect failed");
                }
            }

            let wait = tokio::time::sleep(Duration::from_secs(backoff_secs));
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            debug!(?frame, "offline, frame not sent");
                            membership.track(&frame);
                        }
                        None => return,
                    },
                }
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect(&self) -> Result<Socket, SyncError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SyncError::Header(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        let (socket, _response) = connect_async(request).await?;
        Ok(socket)
    }
}

async fn session(
    socket: Socket,
    membership: &mut Membership,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
    inbound: &mpsc::UnboundedSender<PushEvent>,
) -> Ended {
    let (mut sink, mut stream) = socket.split();

    if let Some(join) = membership.restore() {
        debug!(?join, "restoring room membership");
        if let Err(e) = send_frame(&mut sink, &join).await {
            warn!(error = %e, "push channel send failed");
            return Ended::Dropped;
        }
    }

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.close().await;
                    return Ended::Shutdown;
                };
                membership.track(&frame);
                if let Err(e) = send_frame(&mut sink, &frame).await {
                    warn!(error = %e, "push channel send failed");
                    return Ended::Dropped;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(event) = decode_push(&text) {
                        if inbound.send(event).is_err() {
                            return Ended::Shutdown;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("push channel closed by server");
                    return Ended::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "push channel read failed");
                    return Ended::Dropped;
                }
            },
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<Socket, WsMessage>,
    frame: &ClientFrame,
) -> Result<(), SyncError> {
    let json = serde_json::to_string(frame)?;
    sink.send(WsMessage::text(json)).await?;
    Ok(())
}

fn decode_push(text: &str) -> Option<PushEvent> {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "undecodable push frame");
            return None;
        }
    };
    match frame.into_new_message() {
        Ok(Some(message)) => Some(PushEvent::NewMessage(message)),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "malformed new_message payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    #[test]
    fn decodes_new_message_push() {
        let raw = r#"{"event":"new_message","data":{"id":"m1","conversation_id":"c1","sender_id":"u2","content":"hi","type":"image","created_at":"2024-06-01T08:00:00Z","media_url":"/uploads/a.png"}}"#;
        match decode_push(raw) {
            Some(PushEvent::NewMessage(message)) => {
                assert_eq!(message.kind, MessageKind::Image);
                assert_eq!(message.media_url.as_deref(), Some("/uploads/a.png"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_and_other_events_are_skipped() {
        assert_eq!(decode_push("not json"), None);
        assert_eq!(decode_push(r#"{"event":"presence","data":{}}"#), None);
        assert_eq!(
            decode_push(r#"{"event":"new_message","data":{"id":"m1"}}"#),
            None
        );
    }

    #[test]
    fn membership_follows_the_last_frames() {
        let mut membership = Membership::default();
        membership.track(&ClientFrame::Join { room: "a".into() });
        membership.track(&ClientFrame::Leave { room: "b".into() });
        assert_eq!(membership.restore(), Some(ClientFrame::Join { room: "a".into() }));

        membership.track(&ClientFrame::Join { room: "b".into() });
        membership.track(&ClientFrame::Leave { room: "b".into() });
        assert_eq!(membership.restore(), None);
    }

    #[tokio::test]
    async fn room_is_joined_once_per_socket() {
        use futures::StreamExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();

        // Queued before the socket is up: sent once by the restore, not replayed.
        out_tx.send(ClientFrame::Join { room: "a".into() }).unwrap();
        let handle = PushConnection::new(url, None).spawn(out_rx, in_tx);

        let frames = tokio::time::timeout(Duration::from_secs(5), async {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut server = tokio_tungstenite::accept_async(tcp).await.unwrap();
            assert_eq!(
                in_rx.recv().await,
                Some(PushEvent::Connected { reconnect: false })
            );
            out_tx.send(ClientFrame::Leave { room: "a".into() }).unwrap();

            let mut frames = Vec::new();
            while let Some(Ok(message)) = server.next().await {
                if let WsMessage::Text(text) = message {
                    let frame: ClientFrame = serde_json::from_str(&text).unwrap();
                    let done = matches!(frame, ClientFrame::Leave { .. });
                    frames.push(frame);
                    if done {
                        break;
                    }
                }
            }
            drop(out_tx);
            frames
        })
        .await
        .expect("frames in time");

        assert_eq!(
            frames,
            vec![
                ClientFrame::Join { room: "a".into() },
                ClientFrame::Leave { room: "a".into() },
            ]
        );
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("connection task should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_outbound_queue_stops_while_offline() {
        // Nothing listens on port 9, so every connect fails and the task
        // sits in backoff until the queue closes.
        let connection = PushConnection::new("ws://127.0.0.1:9/ws", None);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let handle = connection.spawn(out_rx, in_tx);
        out_tx
            .send(ClientFrame::Join { room: "c1".into() })
            .unwrap();
        drop(out_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("connection task should stop")
            .unwrap();
    }
}
