//! Connection registry and fan-out with eviction-based backpressure.
//!
//! The hub is the single authority for "who is connected" and "deliver this
//! to everyone else". All three operations run inside one critical section
//! over the registry, so a registration can never be half-visible to a
//! broadcast scan and an eviction can never race an unregister.
//!
//! ```text
//! Session A ──┐                     ┌──► outbox B ──► write loop B
//!             ├── Hub::broadcast ───┤
//! Session C ──┘   (skip sender,     └──► outbox C ──► write loop C
//!                  try_send, evict)
//! ```
//!
//! The hub holds the only strong sender of each outbound queue. Removing an
//! entry drops that sender, which is what closes the queue, so a queue is
//! closed exactly once no matter how removal happens.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Serialized payload shared between every recipient of one broadcast.
pub type Payload = Arc<str>;

/// Sending side of a connection's bounded outbound queue.
pub type Outbox = mpsc::Sender<Payload>;

/// In-process handle for one connection. Never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An immutable (sender, payload) pair submitted for fan-out.
#[derive(Debug, Clone)]
pub struct BroadcastItem {
    sender: ConnectionId,
    payload: Payload,
}

impl BroadcastItem {
    pub fn new(sender: ConnectionId, payload: impl Into<Payload>) -> Self {
        Self {
            sender,
            payload: payload.into(),
        }
    }

    pub fn sender(&self) -> ConnectionId {
        self.sender
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Hub statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

/// Counters updated inside the critical section and read lock-free.
#[derive(Default)]
struct AtomicHubStats {
    connections: AtomicUsize,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// The live-connection registry.
#[derive(Default)]
pub struct Hub {
    peers: Mutex<HashMap<ConnectionId, Outbox>>,
    stats: AtomicHubStats,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the live set.
    pub async fn register(&self, id: ConnectionId, outbox: Outbox) {
        let mut peers = self.peers.lock().await;
        if peers.insert(id, outbox).is_some() {
            log::warn!("Hub: {id} registered twice, previous outbox replaced");
        }
        self.stats.connections.store(peers.len(), Ordering::Relaxed);
        log::debug!("Hub: +{id} (total={})", peers.len());
    }

    /// Remove a connection and close its outbound queue.
    ///
    /// Returns `false` when the connection was not registered, e.g. because
    /// a broadcast already evicted it.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(&id).is_some();
        self.stats.connections.store(peers.len(), Ordering::Relaxed);
        if removed {
            log::debug!("Hub: -{id} (total={})", peers.len());
        }
        removed
    }

    /// Deliver `item` to every registered connection except its sender.
    ///
    /// Never waits on a peer: a full queue evicts that peer on the spot.
    /// Returns the number of connections the payload was enqueued for.
    pub async fn broadcast(&self, item: BroadcastItem) -> usize {
        let mut peers = self.peers.lock().await;
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (id, outbox) in peers.iter() {
            if *id == item.sender {
                continue;
            }
            match outbox.try_send(item.payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Hub: evicting slow consumer {id}");
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Hub: dropping {id}, write loop already gone");
                    evicted.push(*id);
                }
            }
        }

        for id in &evicted {
            peers.remove(id);
        }

        self.stats.connections.store(peers.len(), Ordering::Relaxed);
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);

        delivered
    }

    /// Lock-free statistics snapshot.
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.stats.connections.load(Ordering::Relaxed),
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    async fn join(hub: &Hub, capacity: usize) -> (ConnectionId, mpsc::Receiver<Payload>) {
        let id = ConnectionId::next();
        let (tx, rx) = mpsc::channel(capacity);
        hub.register(id, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = Hub::new();
        let (id, _rx) = join(&hub, 4).await;
        assert_eq!(hub.stats().connections, 1);

        assert!(hub.unregister(id).await);
        assert_eq!(hub.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::new();
        let (id, mut rx) = join(&hub, 4).await;

        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert!(!hub.unregister(ConnectionId::next()).await);

        // Queue closed once and stays closed.
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = Hub::new();
        let (a, mut rx_a) = join(&hub, 4).await;
        let (_b, mut rx_b) = join(&hub, 4).await;
        let (_c, mut rx_c) = join(&hub, 4).await;

        let delivered = hub.broadcast(BroadcastItem::new(a, "hello")).await;
        assert_eq!(delivered, 2);

        assert_eq!(rx_b.try_recv().unwrap().as_ref(), "hello");
        assert_eq!(rx_c.try_recv().unwrap().as_ref(), "hello");
        assert_eq!(rx_a.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_broadcast_delivers_once_per_peer() {
        let hub = Hub::new();
        let (a, _rx_a) = join(&hub, 8).await;
        let (_b, mut rx_b) = join(&hub, 8).await;

        hub.broadcast(BroadcastItem::new(a, "one")).await;
        assert_eq!(rx_b.try_recv().unwrap().as_ref(), "one");
        assert_eq!(rx_b.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted_without_blocking() {
        let hub = Hub::new();
        let (sender, _rx_sender) = join(&hub, 4).await;
        let (slow, mut rx_slow) = join(&hub, 1).await;
        let (_fast, mut rx_fast) = join(&hub, 4).await;

        // Fills the slow queue.
        assert_eq!(hub.broadcast(BroadcastItem::new(sender, "first")).await, 2);
        // Slow queue is full: evicted, fast peer still served.
        let delivered = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            hub.broadcast(BroadcastItem::new(sender, "second")),
        )
        .await
        .expect("broadcast must not block on a slow peer");
        assert_eq!(delivered, 1);

        let stats = hub.stats();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.evictions, 1);

        // Evicted peer sees what was queued, then a closed queue.
        assert_eq!(rx_slow.recv().await.unwrap().as_ref(), "first");
        assert_eq!(rx_slow.recv().await, None);

        // Nothing more reaches it, and unregistering later is a no-op.
        hub.broadcast(BroadcastItem::new(sender, "third")).await;
        assert!(!hub.unregister(slow).await);

        assert_eq!(rx_fast.try_recv().unwrap().as_ref(), "first");
        assert_eq!(rx_fast.try_recv().unwrap().as_ref(), "second");
        assert_eq!(rx_fast.try_recv().unwrap().as_ref(), "third");
    }

    #[tokio::test]
    async fn test_closed_receiver_is_dropped() {
        let hub = Hub::new();
        let (a, _rx_a) = join(&hub, 4).await;
        let (_b, rx_b) = join(&hub, 4).await;
        drop(rx_b);

        assert_eq!(hub.broadcast(BroadcastItem::new(a, "x")).await, 0);
        assert_eq!(hub.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let hub = Hub::new();
        let (a, _rx_a) = join(&hub, 4).await;
        let (_b, _rx_b) = join(&hub, 4).await;

        hub.broadcast(BroadcastItem::new(a, "1")).await;
        hub.broadcast(BroadcastItem::new(a, "2")).await;

        let stats = hub.stats();
        assert_eq!(stats.broadcasts, 2);
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }
}
