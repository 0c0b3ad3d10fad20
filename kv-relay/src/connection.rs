//! One client's transport loops and outbound queue.
//!
//! ```text
//!               ┌────────────── Connection ──────────────┐
//!  socket ─────►│ InboundReader ──► session (handler)    │
//!               │                                        │
//!  Hub ─strong─►│ outbox ══ mpsc(256) ══► write_loop ────┼──► socket
//!  handler weak►│                          └─ keepalive  │
//!               └────────────────────────────────────────┘
//! ```
//!
//! The write loop is the only writer on the socket. It stops when its queue
//! closes (unregister or eviction) or when a write fails or stalls.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::frame::{FrameKind, WireFrame};
use crate::hub::{ConnectionId, Outbox, Payload};
use crate::identity::{Color, Identity};

/// Per-connection transport limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Largest inbound message accepted, in bytes
    pub max_message_size: usize,
    /// Idle-read deadline, renewed by every inbound frame
    pub read_timeout: Duration,
    /// Deadline for each outbound write, keepalives included
    pub write_timeout: Duration,
    /// Interval between transport pings
    pub keepalive_interval: Duration,
    /// Outbound queue capacity, in messages
    pub send_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            send_queue_capacity: 256,
        }
    }
}

/// Why the read side stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why the write loop stopped early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("write stalled for {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A live client as seen by its handler.
///
/// Holds only a weak handle to the outbound queue; the hub owns the strong
/// one, so once the hub lets go the queue is closed for good.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    color: Color,
    outbox: mpsc::WeakSender<Payload>,
}

impl Connection {
    /// Build a connection and its queue.
    ///
    /// The returned [`Outbox`] is the only strong sender and must be handed
    /// to the hub; the receiver belongs to the write loop.
    pub fn new(
        identity: Identity,
        color: Color,
        capacity: usize,
    ) -> (Self, Outbox, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::next(),
            identity,
            color,
            outbox: tx.downgrade(),
        };
        (connection, tx, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn color(&self) -> Color {
        self.color
    }

    /// Enqueue a message for this connection only, bypassing the hub.
    ///
    /// Waits up to `deadline` for room in the queue. Returns `false` if the
    /// queue is closed or stays full.
    pub async fn send_direct(&self, payload: impl Into<Payload>, deadline: Duration) -> bool {
        let Some(outbox) = self.outbox.upgrade() else {
            return false;
        };
        match tokio::time::timeout(deadline, outbox.send(payload.into())).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                log::debug!("{}: direct send after queue closed", self.id);
                false
            }
            Err(_) => {
                log::warn!("{}: queue still full after {deadline:?}", self.id);
                false
            }
        }
    }
}

/// Read side of a transport.
pub struct InboundReader<S> {
    stream: S,
    read_timeout: Duration,
    max_message_size: usize,
}

impl<S, M, E> InboundReader<S>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WireFrame,
    E: Display,
{
    pub fn new(stream: S, config: &ConnectionConfig) -> Self {
        Self {
            stream,
            read_timeout: config.read_timeout,
            max_message_size: config.max_message_size,
        }
    }

    /// Next application payload.
    ///
    /// `Ok(None)` means the peer closed. Keepalive frames only renew the
    /// deadline and are never returned.
    pub async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        loop {
            let frame = match tokio::time::timeout(self.read_timeout, self.stream.next()).await {
                Err(_) => return Err(ReadError::IdleTimeout(self.read_timeout)),
                Ok(None) => return Ok(None),
                Ok(Some(Err(e))) => return Err(ReadError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            };

            match frame.kind() {
                FrameKind::Keepalive => continue,
                FrameKind::Close => return Ok(None),
                FrameKind::Data(bytes) if bytes.len() > self.max_message_size => {
                    return Err(ReadError::TooLarge {
                        size: bytes.len(),
                        limit: self.max_message_size,
                    });
                }
                FrameKind::Data(bytes) => return Ok(Some(bytes)),
            }
        }
    }
}

/// Drain `queue` into `sink` until the queue closes or a write fails.
///
/// Sends a close frame when the queue closes, and closes the sink on every
/// exit path.
pub async fn write_loop<K, M>(
    id: ConnectionId,
    mut sink: K,
    mut queue: mpsc::Receiver<Payload>,
    config: ConnectionConfig,
) -> Result<(), WriteError>
where
    K: Sink<M> + Unpin,
    K::Error: Display,
    M: WireFrame,
{
    let write_timeout = config.write_timeout;
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(payload) => {
                    if let Err(e) = send_frame(&mut sink, M::text(payload.to_string()), write_timeout).await {
                        break Err(e);
                    }
                }
                None => {
                    log::trace!("{id}: queue closed, sending close frame");
                    let _ = send_frame(&mut sink, M::close(), write_timeout).await;
                    break Ok(());
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = send_frame(&mut sink, M::keepalive_probe(), write_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    match &result {
        Ok(()) => log::debug!("{id}: write loop finished"),
        Err(e) => log::debug!("{id}: write loop stopped: {e}"),
    }
    result
}

async fn send_frame<K, M>(sink: &mut K, frame: M, deadline: Duration) -> Result<(), WriteError>
where
    K: Sink<M> + Unpin,
    K::Error: Display,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteError::Transport(e.to_string())),
        Err(_) => Err(WriteError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_millis(50),
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn test_default_limits() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_message_size, 1 << 20);
        assert_eq!(config.read_timeout, Duration::from_secs(60));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.send_queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_reader_skips_keepalive_and_stops_on_close() {
        let (server, mut client) = socket_pair().await;
        let (_sink, stream) = server.split();
        let mut reader = InboundReader::new(stream, &ConnectionConfig::default());

        client.send(Message::text("one")).await.unwrap();
        client.send(Message::Ping(Default::default())).await.unwrap();
        client.send(Message::binary(b"two".to_vec())).await.unwrap();
        client.send(Message::Close(None)).await.unwrap();

        assert_eq!(reader.next_payload().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(reader.next_payload().await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(reader.next_payload().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_idle_timeout() {
        let (server, _client) = socket_pair().await;
        let (_sink, stream) = server.split();
        let config = fast_config();
        let mut reader = InboundReader::new(stream, &config);

        assert_eq!(
            reader.next_payload().await,
            Err(ReadError::IdleTimeout(config.read_timeout))
        );
    }

    #[tokio::test]
    async fn test_reader_rejects_oversized_message() {
        let (server, mut client) = socket_pair().await;
        let (_sink, stream) = server.split();
        let config = ConnectionConfig {
            max_message_size: 8,
            ..ConnectionConfig::default()
        };
        let mut reader = InboundReader::new(stream, &config);

        client.send(Message::text("0123456789")).await.unwrap();
        assert_eq!(
            reader.next_payload().await,
            Err(ReadError::TooLarge { size: 10, limit: 8 })
        );
    }

    #[tokio::test]
    async fn test_write_loop_drains_then_closes() {
        let (server, mut client) = socket_pair().await;
        let (sink, _stream) = server.split();
        let identity = Identity::new("u1");
        let (conn, outbox, rx) = Connection::new(identity, Color::from_rgb(0), 8);
        let writer = tokio::spawn(write_loop::<_, Message>(conn.id(), sink, rx, fast_config()));

        assert!(conn.send_direct("first", Duration::from_millis(100)).await);
        outbox.try_send(Payload::from("second")).unwrap();
        drop(outbox);

        let mut texts = Vec::new();
        let mut saw_close = false;
        while let Some(Ok(msg)) = client.next().await {
            match msg {
                Message::Text(text) => texts.push(text.to_string()),
                Message::Close(_) => {
                    saw_close = true;
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(texts, vec!["first", "second"]);
        assert!(saw_close);
        assert_eq!(writer.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_write_loop_sends_keepalive_when_idle() {
        let (server, mut client) = socket_pair().await;
        let (sink, _stream) = server.split();
        let (conn, outbox, rx) = Connection::new(Identity::new("u1"), Color::from_rgb(0), 8);
        let _writer = tokio::spawn(write_loop::<_, Message>(conn.id(), sink, rx, fast_config()));

        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("keepalive expected")
            .unwrap()
            .unwrap();
        assert!(matches!(msg, Message::Ping(_)));
        drop(outbox);
    }

    #[tokio::test]
    async fn test_write_loop_stops_when_peer_gone() {
        let (server, client) = socket_pair().await;
        let (sink, _stream) = server.split();
        let (conn, outbox, rx) = Connection::new(Identity::new("u1"), Color::from_rgb(0), 8);
        drop(client);

        let writer = tokio::spawn(write_loop::<_, Message>(conn.id(), sink, rx, fast_config()));
        outbox.try_send(Payload::from("lost")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("write loop must stop")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_direct_waits_for_room() {
        let short = Duration::from_millis(50);
        let (conn, outbox, mut rx) = Connection::new(Identity::new("u1"), Color::from_rgb(0), 1);
        assert!(conn.send_direct("a", short).await);
        // Full and nobody draining.
        assert!(!conn.send_direct("b", short).await);

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await;
            (first, rx)
        });
        assert!(conn.send_direct("c", Duration::from_secs(1)).await);
        let (first, mut rx) = consumer.await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("c"));

        drop(outbox);
        assert!(!conn.send_direct("d", short).await);
    }
}
