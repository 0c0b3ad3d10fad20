//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, wait for `welcome`, disconnect)
//! - Select / deselect commands
//! - An event stream of snapshots and peer selections

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::identity::{Color, Identity};
use crate::protocol::{ProtocolError, ServerMessage, SnapshotSelection};

/// How long `connect` waits for the socket and the `welcome` message.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the server assigned on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub identity: Identity,
    pub color: Color,
}

/// Events emitted by the client after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Selections in progress when we joined
    Snapshot(Vec<SnapshotSelection>),
    /// A peer selected an item
    Selection {
        user_id: Identity,
        landmark_key: String,
        color: String,
    },
    /// A peer cleared its selection
    Deselection {
        user_id: Identity,
        landmark_key: String,
        color: String,
    },
    /// Connection lost
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The relay client.
pub struct RelayClient {
    server_url: String,
    welcome: Option<Welcome>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the socket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<RelayEvent>>,
    event_tx: mpsc::Sender<RelayEvent>,
}

impl RelayClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            welcome: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect and wait for the server's `welcome`.
    ///
    /// Spawns background tasks for reading and writing the socket.
    pub async fn connect(&mut self) -> Result<Welcome, ClientError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.handshake().await {
            Ok(welcome) => {
                *self.state.write().await = ConnectionState::Connected;
                Ok(welcome)
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<Welcome, ClientError> {
        let (ws_stream, _) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(self.server_url.as_str()))
                .await
                .map_err(|_| ClientError::Connect("timed out".into()))?
                .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let welcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_welcome(&mut ws_reader))
            .await
            .map_err(|_| ClientError::Handshake("no welcome received".into()))??;

        log::debug!("Connected as {} ({})", welcome.identity, welcome.color);

        // Writer task: forward outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: turn server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let event = match ServerMessage::decode(text.as_str()) {
                    Ok(ServerMessage::Snapshot { selections }) => RelayEvent::Snapshot(selections),
                    Ok(ServerMessage::Selection {
                        user_id,
                        landmark_key,
                        color,
                    }) => RelayEvent::Selection {
                        user_id,
                        landmark_key,
                        color,
                    },
                    Ok(ServerMessage::Deselection {
                        user_id,
                        landmark_key,
                        color,
                    }) => RelayEvent::Deselection {
                        user_id,
                        landmark_key,
                        color,
                    },
                    Ok(ServerMessage::Welcome { .. }) => continue,
                    Err(e) => {
                        log::debug!("Ignoring server message: {e}");
                        continue;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        self.welcome = Some(welcome.clone());
        Ok(welcome)
    }

    /// Select an item.
    pub async fn select(&self, landmark_key: &str) -> Result<(), ClientError> {
        self.send_command("select", landmark_key).await
    }

    /// Clear our selection.
    pub async fn deselect(&self, landmark_key: &str) -> Result<(), ClientError> {
        self.send_command("deselect", landmark_key).await
    }

    async fn send_command(&self, kind: &str, landmark_key: &str) -> Result<(), ClientError> {
        let text = serde_json::json!({ "type": kind, "landmarkKey": landmark_key }).to_string();
        self.send_text(text).await
    }

    /// Send a raw text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::ConnectionClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        // Dropping the sender makes the writer task send a close frame.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// What the server assigned, once connected.
    pub fn welcome(&self) -> Option<&Welcome> {
        self.welcome.as_ref()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Wait for the first text message and require it to be `welcome`.
async fn read_welcome<S>(reader: &mut S) -> Result<Welcome, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match ServerMessage::decode(text.as_str())? {
                    ServerMessage::Welcome { user_id, color } => {
                        let color = Color::parse(&color).ok_or_else(|| {
                            ClientError::Handshake(format!("bad color {color:?}"))
                        })?;
                        Ok(Welcome {
                            identity: user_id,
                            color,
                        })
                    }
                    other => Err(ClientError::Handshake(format!(
                        "expected welcome, got {}",
                        other.kind()
                    ))),
                };
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    Err(ClientError::ConnectionClosed)
}
