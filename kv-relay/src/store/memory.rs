//! In-process presence store.
//!
//! Used when no external store is configured and throughout the tests. It can
//! be flipped into an "unavailable" state so failure handling can be exercised
//! without a real outage.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PresenceStore, StoreError};

#[derive(Default)]
struct Tables {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
}

/// Hashes and sets behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let hash = tables.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let now_empty = match tables.hashes.get_mut(key) {
            Some(hash) => {
                hash.remove(field);
                hash.is_empty()
            }
            None => false,
        };
        // Redis drops a hash once its last field is gone.
        if now_empty {
            tables.hashes.remove(key);
        }
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let now_empty = match tables.sets.get_mut(set) {
            Some(members) => {
                members.remove(member);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            tables.sets.remove(set);
        }
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.hashes.remove(key);
        tables.sets.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
