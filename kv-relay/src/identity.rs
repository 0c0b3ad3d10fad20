//! Server-minted connection identity and display color.
//!
//! Every connection gets exactly one [`Identity`] and one [`Color`] when its
//! handshake completes. Both are produced by an [`IdentityMint`] so tests can
//! swap the random production mint for a deterministic one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, server-assigned user identity.
///
/// Never taken from the client; used as the presence-store join key and as
/// the `userId` tag on every outbound broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 24-bit RGB display color, rendered as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(u32);

impl Color {
    /// Build from a packed `0xRRGGBB` value. Bits above 24 are discarded.
    pub const fn from_rgb(rgb: u32) -> Self {
        Self(rgb & 0x00FF_FFFF)
    }

    pub fn rgb(&self) -> u32 {
        self.0
    }

    /// Parse `#RRGGBB` (leading `#` optional, case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok().map(Self::from_rgb)
    }

    /// Fixed-width uppercase hex form used on the wire and in the store.
    pub fn to_hex(&self) -> String {
        format!("#{:06X}", self.0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

/// Source of identities and colors for new connections.
pub trait IdentityMint: Send + Sync {
    fn mint_identity(&self) -> Identity;
    fn mint_color(&self) -> Color;
}

/// Production mint: UUID v4 identities, uniformly random colors.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomMint;

impl IdentityMint for RandomMint {
    fn mint_identity(&self) -> Identity {
        Identity(Uuid::new_v4().to_string())
    }

    fn mint_color(&self) -> Color {
        Color::from_rgb(rand::random::<u32>())
    }
}

/// Deterministic mint: identities `{prefix}1`, `{prefix}2`, ... and colors
/// cycled from a fixed palette.
#[derive(Debug)]
pub struct SequenceMint {
    prefix: String,
    palette: Vec<Color>,
    next_identity: AtomicU64,
    next_color: AtomicU64,
}

impl SequenceMint {
    pub fn new(prefix: impl Into<String>, palette: Vec<Color>) -> Self {
        let palette = if palette.is_empty() {
            vec![Color::from_rgb(0x3399FF)]
        } else {
            palette
        };
        Self {
            prefix: prefix.into(),
            palette,
            next_identity: AtomicU64::new(1),
            next_color: AtomicU64::new(0),
        }
    }
}

impl IdentityMint for SequenceMint {
    fn mint_identity(&self) -> Identity {
        let n = self.next_identity.fetch_add(1, Ordering::Relaxed);
        Identity(format!("{}{n}", self.prefix))
    }

    fn mint_color(&self) -> Color {
        let n = self.next_color.fetch_add(1, Ordering::Relaxed) as usize;
        self.palette[n % self.palette.len()]
    }
}
