//! Transport-neutral view of a WebSocket frame.
//!
//! The server side runs on axum's WebSocket, the client and the in-memory
//! test harness on tokio-tungstenite. Connection loops are written against
//! [`WireFrame`] so both message types drive the same code.

use axum::extract::ws::Message as AxumMessage;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// What the read loop cares about in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Text or binary application data.
    Data(Vec<u8>),
    /// Ping or pong; only renews the read deadline.
    Keepalive,
    /// Peer-initiated close.
    Close,
}

pub trait WireFrame: Sized + Send + 'static {
    fn text(payload: String) -> Self;
    fn keepalive_probe() -> Self;
    fn close() -> Self;
    fn kind(self) -> FrameKind;
}

impl WireFrame for AxumMessage {
    fn text(payload: String) -> Self {
        AxumMessage::Text(payload.into())
    }

    fn keepalive_probe() -> Self {
        AxumMessage::Ping(Default::default())
    }

    fn close() -> Self {
        AxumMessage::Close(None)
    }

    fn kind(self) -> FrameKind {
        match self {
            AxumMessage::Text(text) => FrameKind::Data(text.as_str().as_bytes().to_vec()),
            AxumMessage::Binary(data) => FrameKind::Data(data.to_vec()),
            AxumMessage::Ping(_) | AxumMessage::Pong(_) => FrameKind::Keepalive,
            AxumMessage::Close(_) => FrameKind::Close,
        }
    }
}

impl WireFrame for TungsteniteMessage {
    fn text(payload: String) -> Self {
        TungsteniteMessage::Text(payload.into())
    }

    fn keepalive_probe() -> Self {
        TungsteniteMessage::Ping(Default::default())
    }

    fn close() -> Self {
        TungsteniteMessage::Close(None)
    }

    fn kind(self) -> FrameKind {
        match self {
            TungsteniteMessage::Text(text) => FrameKind::Data(text.as_str().as_bytes().to_vec()),
            TungsteniteMessage::Binary(data) => FrameKind::Data(data.to_vec()),
            TungsteniteMessage::Close(_) => FrameKind::Close,
            // Raw frames only surface when writing; treat like a keepalive.
            TungsteniteMessage::Ping(_)
            | TungsteniteMessage::Pong(_)
            | TungsteniteMessage::Frame(_) => FrameKind::Keepalive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tungstenite_kinds() {
        assert_eq!(
            TungsteniteMessage::text("hi".to_string()).kind(),
            FrameKind::Data(b"hi".to_vec())
        );
        assert_eq!(
            <TungsteniteMessage as WireFrame>::keepalive_probe().kind(),
            FrameKind::Keepalive
        );
        assert_eq!(<TungsteniteMessage as WireFrame>::close().kind(), FrameKind::Close);
    }

    #[test]
    fn test_axum_kinds() {
        assert_eq!(
            <AxumMessage as WireFrame>::text("hi".to_string()).kind(),
            FrameKind::Data(b"hi".to_vec())
        );
        assert_eq!(
            AxumMessage::Pong(Default::default()).kind(),
            FrameKind::Keepalive
        );
        assert_eq!(<AxumMessage as WireFrame>::close().kind(), FrameKind::Close);
    }
}
