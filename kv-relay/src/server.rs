//! Relay server: store, hub and HTTP surface wired together.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Hub (registry + fan-out)
//!            ├── axum /ws ── Relay ──┤
//! Client B ──┘                       └── PresenceClient ── PresenceStore
//!                                                           ├── Redis
//!                                                           ├── RocksDB
//!                                                           └── memory
//! ```

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::RelayConfig;
use crate::http::build_router;
use crate::hub::HubStats;
use crate::identity::IdentityMint;
use crate::presence::{PresenceClient, PresenceKeys};
use crate::session::Relay;
use crate::store::PresenceStore;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    relay: Relay,
}

impl RelayServer {
    /// Create a server over an already opened store.
    pub fn new(config: RelayConfig, store: Arc<dyn PresenceStore>) -> Self {
        let presence = PresenceClient::new(store, PresenceKeys::new(config.key_prefix.clone()));
        let relay = Relay::new(presence).with_connection_config(config.connection.clone());
        Self { config, relay }
    }

    /// Open the configured store and create the server.
    pub fn open(config: RelayConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let store = config.store.open()?;
        log::info!("Using {} presence store", store.backend());
        Ok(Self::new(config, store))
    }

    /// Replace the identity source.
    pub fn with_mint(mut self, mint: Arc<dyn IdentityMint>) -> Self {
        self.relay = self.relay.with_mint(mint);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn hub_stats(&self) -> HubStats {
        self.relay.hub().stats()
    }

    pub fn router(&self) -> Router {
        build_router(
            self.relay.clone(),
            &self.config.ws_path,
            &self.config.cors,
            self.config.log_level >= log::LevelFilter::Info,
        )
    }

    /// Listen on the configured address until Ctrl-C.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            log::info!("Shutdown requested");
        })
        .await
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn run_until<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Reachability only; the relay runs without its store.
        if let Err(e) = self.relay.presence().store().ping().await {
            log::warn!("Presence store not reachable yet: {e}");
        }

        let router = self.router();
        log::info!(
            "Relay listening on {} (ws path {})",
            listener.local_addr()?,
            self.config.ws_path
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        log::info!("Relay stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};

    #[test]
    fn test_open_memory_store() {
        let config = RelayConfig {
            store: StoreBackend::Memory,
            key_prefix: "test".into(),
            ..RelayConfig::default()
        };
        let server = RelayServer::open(config).unwrap();
        assert_eq!(server.relay().presence().keys().active_users(), "test:active_users");
        assert_eq!(server.hub_stats().connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_future_stops_server() {
        let server = RelayServer::new(RelayConfig::default(), Arc::new(MemoryStore::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(server.run_until(listener, async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server must stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let server = RelayServer::new(RelayConfig::default(), store);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let handle = tokio::spawn(server.run_until(listener, async {}));
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server must stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
