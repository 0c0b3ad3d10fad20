//! Presence store backends.
//!
//! The relay consumes a small key/value surface (hashes and sets, Redis
//! style) and never owns the store's durability. Three backends implement it:
//!
//! ```text
//!                    ┌──────────────┐
//!  PresenceClient ──►│ PresenceStore│
//!                    └──────┬───────┘
//!           ┌───────────────┼────────────────┐
//!           ▼               ▼                ▼
//!     MemoryStore       RocksStore       RedisStore
//!     (in-process)      (local, durable) (external service)
//! ```

pub mod memory;
pub mod redis;
pub mod rocks;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisConfig, RedisStore};
pub use self::rocks::{RocksStore, StoreConfig};

/// The key/value operations the relay needs.
///
/// Every call is idempotent the way its Redis namesake is: setting an
/// existing field overwrites it, deleting a missing field or key is a no-op,
/// adding an existing member is a no-op.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert `fields` into the hash at `key`.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// All fields of the hash at `key`; empty when absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError>;

    /// Members of `set`, in no particular order.
    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Remove `key` entirely, whatever it holds.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The backend rejected or failed the operation.
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Which backend the server should open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Rocks(StoreConfig),
    Redis(RedisConfig),
}

impl StoreBackend {
    /// Open the configured backend.
    ///
    /// Redis connects lazily, so an unreachable Redis is not an error here.
    pub fn open(&self) -> Result<Arc<dyn PresenceStore>, StoreError> {
        Ok(match self {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Rocks(config) => Arc::new(RocksStore::open(config.clone())?),
            StoreBackend::Redis(config) => Arc::new(RedisStore::new(config.clone())?),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Rocks(_) => "rocksdb",
            StoreBackend::Redis(_) => "redis",
        }
    }
}
