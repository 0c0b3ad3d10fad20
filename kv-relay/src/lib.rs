//! # kv-relay: real-time presence and selection relay
//!
//! Clients connect over WebSocket, receive a server-minted identity and
//! display color, and broadcast which item they have selected to every other
//! connected client. A presence store keeps the current selection of each
//! active user so newcomers start from a snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RelayClient │ ◄────────────────► │ RelayServer  │
//! │ (per user)  │     JSON text      │ (axum)       │
//! └─────────────┘                    └──────┬───────┘
//!                                           │ one session per socket
//!                              ┌────────────┴────────────┐
//!                              ▼                         ▼
//!                       ┌─────────────┐          ┌───────────────┐
//!                       │ Hub         │          │ PresenceStore │
//!                       │ (fan-out)   │          │ redis/rocksdb │
//!                       └─────────────┘          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`identity`]: identities, colors and the mint that produces them
//! - [`hub`]: connection registry with eviction-based backpressure
//! - [`connection`]: read loop, write loop with keepalive
//! - [`session`]: per-connection protocol state machine
//! - [`presence`]: typed presence operations and key layout
//! - [`store`]: presence store backends
//! - [`config`]: environment configuration
//! - [`http`]: router, CORS, request log
//! - [`server`]: server wiring
//! - [`client`]: WebSocket client

pub mod client;
pub mod config;
pub mod connection;
pub mod frame;
pub mod http;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use client::{ClientError, ConnectionState, RelayClient, RelayEvent, Welcome};
pub use config::{parse_log_level, ConfigError, CorsConfig, RelayConfig};
pub use connection::{Connection, ConnectionConfig, InboundReader, ReadError, WriteError};
pub use hub::{BroadcastItem, ConnectionId, Hub, HubStats};
pub use identity::{Color, Identity, IdentityMint, RandomMint, SequenceMint};
pub use presence::{PresenceClient, PresenceKeys};
pub use protocol::{ClientCommand, ProtocolError, ServerMessage, SnapshotSelection};
pub use server::RelayServer;
pub use session::{CloseReason, Relay, SessionReport, SessionState, TeardownStep};
pub use store::{
    MemoryStore, PresenceStore, RedisConfig, RedisStore, RocksStore, StoreBackend, StoreConfig,
    StoreError,
};
