//! Per-connection protocol handler.
//!
//! ```text
//! Connecting ──► Bootstrapping ──► Active ──► Closing ──► Closed
//!  mint id,       presence write,   select /    teardown
//!  color, queue   hub register,     deselect    steps
//!                 welcome, snapshot
//! ```
//!
//! Store failures never reach the client: they are logged and the session
//! carries on as if the write had landed.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::connection::{write_loop, Connection, ConnectionConfig, InboundReader, ReadError, WriteError};
use crate::frame::WireFrame;
use crate::hub::{BroadcastItem, Hub, Outbox};
use crate::identity::{Identity, IdentityMint, RandomMint};
use crate::presence::{now_secs, PresenceClient};
use crate::protocol::{ClientCommand, ServerMessage};
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Bootstrapping,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// The only state reachable from `self`.
    pub fn next(self) -> Option<Self> {
        match self {
            SessionState::Connecting => Some(SessionState::Bootstrapping),
            SessionState::Bootstrapping => Some(SessionState::Active),
            SessionState::Active => Some(SessionState::Closing),
            SessionState::Closing => Some(SessionState::Closed),
            SessionState::Closed => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Bootstrapping => "bootstrapping",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Cleanup actions run when a session ends, in this order.
///
/// Each step runs even if an earlier one failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    /// Leave the hub, which closes the outbound queue.
    Unregister,
    /// Release the read half and wait for the write loop to close the socket.
    CloseTransport,
    /// Remove the identity from the active-user set.
    LeaveActiveSet,
    /// Delete the identity's presence hash.
    DeleteKey,
}

impl TeardownStep {
    pub const ORDER: [TeardownStep; 4] = [
        TeardownStep::Unregister,
        TeardownStep::CloseTransport,
        TeardownStep::LeaveActiveSet,
        TeardownStep::DeleteKey,
    ];
}

#[derive(Debug, thiserror::Error)]
enum TeardownError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("write loop still running after {0:?}")]
    WriterStuck(Duration),
    #[error("write loop task failed: {0}")]
    WriterTask(String),
}

/// Why a session left the active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream.
    PeerClosed,
    ReadFailed(ReadError),
    /// The hub dropped the connection as a slow consumer.
    Evicted,
    /// The write loop hit an error or a stalled write.
    WriteFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ReadFailed(e) => write!(f, "read failed: {e}"),
            CloseReason::Evicted => f.write_str("evicted"),
            CloseReason::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// Outcome of one finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub identity: Identity,
    pub reason: CloseReason,
    /// Teardown steps that did not complete cleanly.
    pub teardown_failures: Vec<TeardownStep>,
}

/// Everything a session needs, shared by all connections.
#[derive(Clone)]
pub struct Relay {
    hub: Arc<Hub>,
    presence: PresenceClient,
    mint: Arc<dyn IdentityMint>,
    config: ConnectionConfig,
}

impl Relay {
    /// A relay with a fresh hub, random identities and default limits.
    pub fn new(presence: PresenceClient) -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            presence,
            mint: Arc::new(RandomMint),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_mint(mut self, mint: Arc<dyn IdentityMint>) -> Self {
        self.mint = mint;
        self
    }

    pub fn with_connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn presence(&self) -> &PresenceClient {
        &self.presence
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Drive one upgraded socket from handshake to teardown.
    pub async fn serve<T, M, E>(&self, socket: T) -> SessionReport
    where
        T: Stream<Item = Result<M, E>> + Sink<M> + Send + 'static,
        <T as Sink<M>>::Error: Display + Send,
        M: WireFrame + Unpin,
        E: Display + Send,
    {
        let mut state = SessionState::Connecting;

        let identity = self.mint.mint_identity();
        let color = self.mint.mint_color();
        let (connection, outbox, queue) =
            Connection::new(identity, color, self.config.send_queue_capacity);
        let id = connection.id();

        let (sink, stream) = socket.split::<M>();
        let mut writer = tokio::spawn(write_loop::<_, M>(id, sink, queue, self.config.clone()));
        let mut reader = InboundReader::new(stream, &self.config);
        log::info!(
            "{id}: connected as {} ({})",
            connection.identity(),
            connection.color()
        );

        advance(&mut state, &connection);
        self.bootstrap(&connection, outbox).await;

        advance(&mut state, &connection);
        let mut writer_done = false;
        let reason = loop {
            tokio::select! {
                read = reader.next_payload() => match read {
                    Ok(Some(bytes)) => self.handle_payload(&connection, &bytes).await,
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(e) => break CloseReason::ReadFailed(e),
                },
                joined = &mut writer, if !writer_done => {
                    writer_done = true;
                    break match joined {
                        Ok(Ok(())) => CloseReason::Evicted,
                        Ok(Err(e)) => CloseReason::WriteFailed(e.to_string()),
                        Err(e) => CloseReason::WriteFailed(e.to_string()),
                    };
                }
            }
        };
        log::info!("{id}: {} leaving ({reason})", connection.identity());

        advance(&mut state, &connection);
        drop(reader);
        let writer = (!writer_done).then_some(writer);
        let teardown_failures = self.teardown(&connection, writer).await;

        advance(&mut state, &connection);
        SessionReport {
            identity: connection.identity().clone(),
            reason,
            teardown_failures,
        }
    }

    async fn bootstrap(&self, connection: &Connection, outbox: Outbox) {
        let id = connection.id();
        let identity = connection.identity();

        if let Err(e) = self
            .presence
            .register_user(identity, connection.color(), now_secs())
            .await
        {
            log::warn!("{id}: failed to record presence for {identity}: {e}");
        }
        if let Err(e) = self.presence.add_active(identity).await {
            log::warn!("{id}: failed to add {identity} to active set: {e}");
        }

        self.hub.register(id, outbox).await;

        self.send_direct(
            connection,
            &ServerMessage::Welcome {
                user_id: identity.clone(),
                color: connection.color().to_hex(),
            },
        )
        .await;

        let selections = match self.presence.snapshot().await {
            Ok(selections) => selections,
            Err(e) => {
                log::warn!("{id}: snapshot unavailable, sending empty one: {e}");
                Vec::new()
            }
        };
        log::debug!("{id}: snapshot with {} selections", selections.len());
        self.send_direct(connection, &ServerMessage::Snapshot { selections })
            .await;
    }

    async fn handle_payload(&self, connection: &Connection, bytes: &[u8]) {
        let id = connection.id();
        let command = match ClientCommand::parse(bytes) {
            Ok(command) => command,
            Err(e) => {
                log::debug!("{id}: ignoring inbound message: {e}");
                return;
            }
        };

        let identity = connection.identity();
        let color = connection.color().to_hex();
        match command {
            ClientCommand::Select { landmark_key } => {
                if landmark_key.is_empty() {
                    log::debug!("{id}: ignoring select with empty key");
                    return;
                }
                if let Err(e) = self
                    .presence
                    .set_selection(identity, &landmark_key, now_secs())
                    .await
                {
                    log::warn!("{id}: failed to store selection for {identity}: {e}");
                }
                self.broadcast(
                    connection,
                    ServerMessage::Selection {
                        user_id: identity.clone(),
                        landmark_key,
                        color,
                    },
                )
                .await;
            }
            ClientCommand::Deselect { landmark_key } => {
                if let Err(e) = self.presence.clear_selection(identity, now_secs()).await {
                    log::warn!("{id}: failed to clear selection for {identity}: {e}");
                }
                self.broadcast(
                    connection,
                    ServerMessage::Deselection {
                        user_id: identity.clone(),
                        landmark_key,
                        color,
                    },
                )
                .await;
            }
            ClientCommand::Unknown(kind) => {
                log::debug!("{id}: ignoring message of type {kind:?}");
            }
        }
    }

    /// Queue a message for this connection alone, waiting at most the write
    /// deadline for room.
    async fn send_direct(&self, connection: &Connection, message: &ServerMessage) {
        match message.encode() {
            Ok(payload) => {
                if !connection
                    .send_direct(payload, self.config.write_timeout)
                    .await
                {
                    log::warn!("{}: {} not queued", connection.id(), message.kind());
                }
            }
            Err(e) => log::error!("{}: {e}", connection.id()),
        }
    }

    async fn broadcast(&self, connection: &Connection, message: ServerMessage) {
        match message.encode() {
            Ok(payload) => {
                let delivered = self
                    .hub
                    .broadcast(BroadcastItem::new(connection.id(), payload))
                    .await;
                log::trace!(
                    "{}: {} delivered to {delivered} peers",
                    connection.id(),
                    message.kind()
                );
            }
            Err(e) => log::error!("{}: {e}", connection.id()),
        }
    }

    /// Run every [`TeardownStep`] in order and return the ones that failed.
    async fn teardown(
        &self,
        connection: &Connection,
        mut writer: Option<JoinHandle<Result<(), WriteError>>>,
    ) -> Vec<TeardownStep> {
        let mut failures = Vec::new();
        for step in TeardownStep::ORDER {
            let result = match step {
                TeardownStep::Unregister => {
                    if !self.hub.unregister(connection.id()).await {
                        log::debug!("{}: already out of the hub", connection.id());
                    }
                    Ok(())
                }
                TeardownStep::CloseTransport => self.close_transport(writer.take()).await,
                TeardownStep::LeaveActiveSet => self
                    .presence
                    .remove_active(connection.identity())
                    .await
                    .map_err(TeardownError::from),
                TeardownStep::DeleteKey => self
                    .presence
                    .delete_user(connection.identity())
                    .await
                    .map_err(TeardownError::from),
            };
            if let Err(e) = result {
                log::warn!("{}: teardown {step:?} failed: {e}", connection.id());
                failures.push(step);
            }
        }
        failures
    }

    async fn close_transport(
        &self,
        writer: Option<JoinHandle<Result<(), WriteError>>>,
    ) -> Result<(), TeardownError> {
        let Some(mut writer) = writer else {
            return Ok(());
        };
        // The queue is closed by now; the write loop only has the close frame
        // and the sink shutdown left, each bounded by the write deadline.
        let grace = self.config.write_timeout * 2;
        match tokio::time::timeout(grace, &mut writer).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TeardownError::WriterTask(e.to_string())),
            Err(_) => {
                writer.abort();
                Err(TeardownError::WriterStuck(grace))
            }
        }
    }
}

fn advance(state: &mut SessionState, connection: &Connection) {
    if let Some(next) = state.next() {
        log::trace!("{}: {state} -> {next}", connection.id());
        *state = next;
    }
}
