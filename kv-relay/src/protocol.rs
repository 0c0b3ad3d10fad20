//! JSON wire protocol.
//!
//! Every frame is a self-describing JSON object with a `type` field:
//!
//! ```text
//! server → client   {"type":"welcome","userId":"…","color":"#AABBCC"}
//! server → client   {"type":"snapshot","selections":[{"userId","landmarkKey","color"}]}
//! client → server   {"type":"select","landmarkKey":"tree-42"}
//! client → server   {"type":"deselect","landmarkKey":"tree-42"}
//! server → others   {"type":"selection","userId","landmarkKey","color"}
//! server → others   {"type":"deselection","userId","landmarkKey","color"}
//! ```
//!
//! Inbound types are matched case-insensitively and `select`/`selection`
//! (`deselect`/`deselection`) are synonyms. A `userId` sent by a client is
//! parsed but never trusted.

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// A client-side command after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Select an item. The key is trimmed and may be empty; the session
    /// rejects empty keys.
    Select { landmark_key: String },
    /// Clear the current selection. The key is only echoed to peers.
    Deselect { landmark_key: String },
    /// Any other `type`, kept for logging.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "userId", default)]
    #[allow(dead_code)]
    user_id: Option<String>,
    #[serde(rename = "landmarkKey", default)]
    landmark_key: Option<String>,
}

impl ClientCommand {
    /// Parse one inbound frame.
    ///
    /// Fails only when the payload is not a JSON object matching the
    /// envelope; unrecognized types come back as [`ClientCommand::Unknown`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: InboundEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = envelope.kind.unwrap_or_default();
        let landmark_key = envelope
            .landmark_key
            .map(|k| k.trim().to_string())
            .unwrap_or_default();

        Ok(match kind.to_ascii_lowercase().as_str() {
            "select" | "selection" => ClientCommand::Select { landmark_key },
            "deselect" | "deselection" => ClientCommand::Deselect { landmark_key },
            _ => ClientCommand::Unknown(kind),
        })
    }
}

/// One entry of a `snapshot` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSelection {
    pub user_id: Identity,
    pub landmark_key: String,
    pub color: String,
}

/// Messages produced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Welcome { user_id: Identity, color: String },
    Snapshot { selections: Vec<SnapshotSelection> },
    #[serde(rename_all = "camelCase")]
    Selection {
        user_id: Identity,
        landmark_key: String,
        color: String,
    },
    #[serde(rename_all = "camelCase")]
    Deselection {
        user_id: Identity,
        landmark_key: String,
        color: String,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Wire name of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::Selection { .. } => "selection",
            ServerMessage::Deselection { .. } => "deselection",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
