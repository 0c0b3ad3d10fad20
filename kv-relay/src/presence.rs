//! Typed presence operations over a [`PresenceStore`].
//!
//! Key layout:
//!
//! ```text
//! {prefix}:users:{identity}   hash  color, connectedAt, landmarkKey, lastUpdated
//! {prefix}:active_users       set   identities with a live connection
//! ```
//!
//! Timestamps are Unix seconds, stored as decimal strings.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{Color, Identity};
use crate::protocol::SnapshotSelection;
use crate::store::{PresenceStore, StoreError};

pub const FIELD_COLOR: &str = "color";
pub const FIELD_CONNECTED_AT: &str = "connectedAt";
pub const FIELD_LANDMARK_KEY: &str = "landmarkKey";
pub const FIELD_LAST_UPDATED: &str = "lastUpdated";

pub const DEFAULT_KEY_PREFIX: &str = "kv";

/// Store key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceKeys {
    prefix: String,
}

impl PresenceKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn user(&self, identity: &Identity) -> String {
        format!("{}:users:{}", self.prefix, identity)
    }

    pub fn active_users(&self) -> String {
        format!("{}:active_users", self.prefix)
    }
}

impl Default for PresenceKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct PresenceClient {
    store: Arc<dyn PresenceStore>,
    keys: PresenceKeys,
}

impl PresenceClient {
    pub fn new(store: Arc<dyn PresenceStore>, keys: PresenceKeys) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &PresenceKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Record a fresh connection's color and connect time.
    pub async fn register_user(
        &self,
        identity: &Identity,
        color: Color,
        at: u64,
    ) -> Result<(), StoreError> {
        self.store
            .hset(
                &self.keys.user(identity),
                &[
                    (FIELD_COLOR, color.to_hex()),
                    (FIELD_CONNECTED_AT, at.to_string()),
                ],
            )
            .await
    }

    pub async fn add_active(&self, identity: &Identity) -> Result<(), StoreError> {
        self.store
            .sadd(&self.keys.active_users(), identity.as_str())
            .await
    }

    pub async fn remove_active(&self, identity: &Identity) -> Result<(), StoreError> {
        self.store
            .srem(&self.keys.active_users(), identity.as_str())
            .await
    }

    /// Overwrite the user's current selection. `landmark_key` must already be
    /// trimmed and non-empty.
    pub async fn set_selection(
        &self,
        identity: &Identity,
        landmark_key: &str,
        at: u64,
    ) -> Result<(), StoreError> {
        self.store
            .hset(
                &self.keys.user(identity),
                &[
                    (FIELD_LANDMARK_KEY, landmark_key.to_string()),
                    (FIELD_LAST_UPDATED, at.to_string()),
                ],
            )
            .await
    }

    /// Drop the user's selection and bump `lastUpdated`.
    ///
    /// Both writes are attempted; the first error is returned.
    pub async fn clear_selection(&self, identity: &Identity, at: u64) -> Result<(), StoreError> {
        let key = self.keys.user(identity);
        let cleared = self.store.hdel(&key, FIELD_LANDMARK_KEY).await;
        let touched = self
            .store
            .hset(&key, &[(FIELD_LAST_UPDATED, at.to_string())])
            .await;
        cleared.and(touched)
    }

    pub async fn delete_user(&self, identity: &Identity) -> Result<(), StoreError> {
        self.store.del(&self.keys.user(identity)).await
    }

    /// Every active user's current selection, ordered by identity.
    ///
    /// Members whose fields can't be read, or whose `landmarkKey` or `color`
    /// is blank, are left out. Only a failure to enumerate the active set
    /// is an error.
    pub async fn snapshot(&self) -> Result<Vec<SnapshotSelection>, StoreError> {
        let mut members = self.store.smembers(&self.keys.active_users()).await?;
        members.sort();
        members.dedup();

        let mut selections = Vec::with_capacity(members.len());
        for member in members {
            let identity = Identity::new(member);
            let fields = match self.store.hgetall(&self.keys.user(&identity)).await {
                Ok(fields) => fields,
                Err(e) => {
                    log::warn!("Snapshot: skipping {identity}: {e}");
                    continue;
                }
            };

            let landmark_key = fields
                .get(FIELD_LANDMARK_KEY)
                .map(|v| v.trim())
                .unwrap_or_default();
            let color = fields
                .get(FIELD_COLOR)
                .map(|v| v.trim())
                .unwrap_or_default();
            if landmark_key.is_empty() || color.is_empty() {
                continue;
            }

            selections.push(SnapshotSelection {
                landmark_key: landmark_key.to_string(),
                color: color.to_string(),
                user_id: identity,
            });
        }
        Ok(selections)
    }
}
