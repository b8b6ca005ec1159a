//! Registry of peers accepted by one listener

use super::handle::Connection;
use linkwire_shared::PeerIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Tracks the live connections of a single listener
///
/// Each listener owns its own registry; there is no process-wide table.
/// Entries are inserted by the accept path and removed by the connection's
/// driver when it reaches `Closed`.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// Map of peer identity -> connection
    entries: Arc<RwLock<HashMap<PeerIdentity, Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted connection
    pub(crate) async fn register(&self, connection: Connection) {
        let peer = connection.peer().clone();
        let mut entries = self.entries.write().await;
        if let Some(previous) = entries.insert(peer, connection) {
            warn!("Registry entry for {} replaced (was {})", previous.peer(), previous);
        }
    }

    /// Remove `connection`, unless its peer slot was already taken over
    /// by a newer connection
    pub(crate) async fn unregister(&self, connection: &Connection) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(connection.peer()) {
            Some(current) if current == connection => {
                entries.remove(connection.peer());
                true
            }
            _ => false,
        }
    }

    /// Get the connection for a specific peer
    pub async fn get(&self, peer: &PeerIdentity) -> Option<Connection> {
        self.entries.read().await.get(peer).cloned()
    }

    pub async fn contains(&self, peer: &PeerIdentity) -> bool {
        self.entries.read().await.contains_key(peer)
    }

    /// All live connections
    pub async fn connections(&self) -> Vec<Connection> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Identities of all connected peers
    pub async fn peers(&self) -> Vec<PeerIdentity> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Get the number of connected peers
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRole;

    fn peer_connection(name: &str) -> Connection {
        let (connection, _parts) = Connection::new(
            1,
            ConnectionRole::AcceptedPeer,
            PeerIdentity::Named(name.into()),
            "Test",
        );
        connection
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty().await);

        let a = peer_connection("a");
        let b = peer_connection("b");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        assert_eq!(registry.count().await, 2);
        assert_eq!(registry.get(a.peer()).await, Some(a.clone()));
        assert!(registry.contains(b.peer()).await);

        let mut peers = registry.peers().await;
        peers.sort_by_key(|p| p.to_string());
        assert_eq!(peers, vec![a.peer().clone(), b.peer().clone()]);
    }

    #[tokio::test]
    async fn test_unregister_removes_only_that_entry() {
        let registry = ConnectionRegistry::new();
        let a = peer_connection("a");
        let b = peer_connection("b");
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        assert!(registry.unregister(&a).await);
        assert!(!registry.contains(a.peer()).await);
        assert!(registry.contains(b.peer()).await);

        // Second removal is a no-op
        assert!(!registry.unregister(&a).await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_entry() {
        let registry = ConnectionRegistry::new();
        let old = peer_connection("same-peer");
        let new = peer_connection("same-peer");

        registry.register(old.clone()).await;
        registry.register(new.clone()).await;
        assert_eq!(registry.count().await, 1);

        assert!(!registry.unregister(&old).await);
        assert_eq!(registry.get(new.peer()).await, Some(new));
    }

    #[tokio::test]
    async fn test_registries_are_independent() {
        let first = ConnectionRegistry::new();
        let second = ConnectionRegistry::new();
        first.register(peer_connection("a")).await;

        assert_eq!(first.count().await, 1);
        assert_eq!(second.count().await, 0);
    }
}
