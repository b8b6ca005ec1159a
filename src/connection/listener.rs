//! Server-side listener endpoint

use super::handle::Connection;
use super::registry::ConnectionRegistry;
use futures::future::join_all;
use linkwire_shared::{ConnectionState, ConnectionStateMachine, LifecycleEvent, PeerIdentity};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A bound server endpoint and the peers it accepted
///
/// The accept task watches the shutdown signal handed out by
/// [`Listener::bound`]; dropping the listener also signals it.
pub struct Listener {
    name: String,
    medium: &'static str,
    local: PeerIdentity,
    fsm: ConnectionStateMachine,
    registry: ConnectionRegistry,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Listener for an endpoint that was just claimed
    pub(crate) fn bound(
        name: impl Into<String>,
        medium: &'static str,
        local: PeerIdentity,
    ) -> (Self, watch::Receiver<bool>) {
        let mut fsm = ConnectionStateMachine::new();
        fsm.process_event(LifecycleEvent::Bound);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = Self {
            name: name.into(),
            medium,
            local,
            fsm,
            registry: ConnectionRegistry::new(),
            shutdown,
            task: None,
        };
        info!("[{}] {} listening on {}", listener.name, medium, listener.local);
        (listener, shutdown_rx)
    }

    /// Hand over the accept task
    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn state(&self) -> ConnectionState {
        self.fsm.state()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Stop accepting, then close every registered peer
    pub(crate) async fn close(mut self) {
        self.fsm.process_event(LifecycleEvent::CloseRequested);
        let _ = self.shutdown.send(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("[{}] {} accept task ended abnormally: {}", self.name, self.medium, e);
            }
        }

        let peers = self.registry.connections().await;
        join_all(peers.iter().map(Connection::close)).await;

        self.fsm.process_event(LifecycleEvent::TeardownComplete);
        info!("[{}] {} listener on {} closed", self.name, self.medium, self.local);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
