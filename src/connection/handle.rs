//! Owner-facing connection handle

use bytes::Bytes;
use linkwire_shared::{ConnectionState, PeerIdentity, TransportError, TransportFault};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side created a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Opened by `connect()`
    Client,
    /// Bound endpoint producing peers
    Listener,
    /// Produced by a listener
    AcceptedPeer,
}

/// Commands processed in order by the connection driver
#[derive(Debug)]
pub(crate) enum Command {
    Send(Bytes),
    Close,
}

/// Snapshot published by the driver
#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub state: ConnectionState,
    pub last_error: Option<TransportFault>,
    /// Set once `connection_lost` has been delivered
    pub finished: bool,
}

/// Driver-side ends of a new connection
pub(crate) struct DriverParts {
    pub status: watch::Sender<Status>,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

/// Handle to one logical connection
///
/// Cheap to clone. Gives read-only access to the connection's identity and
/// state; data and teardown go through the owning transport.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    transport_id: u64,
    role: ConnectionRole,
    peer: PeerIdentity,
    medium: &'static str,
    status: watch::Receiver<Status>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Create an open connection and the parts its driver needs
    pub(crate) fn new(
        transport_id: u64,
        role: ConnectionRole,
        peer: PeerIdentity,
        medium: &'static str,
    ) -> (Self, DriverParts) {
        let (status_tx, status_rx) = watch::channel(Status {
            state: ConnectionState::Open,
            last_error: None,
            finished: false,
        });
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let connection = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                transport_id,
                role,
                peer,
                medium,
                status: status_rx,
                commands: command_tx,
            }),
        };
        let parts = DriverParts {
            status: status_tx,
            commands: command_rx,
        };
        (connection, parts)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    /// Far end of the connection
    pub fn peer(&self) -> &PeerIdentity {
        &self.inner.peer
    }

    /// Name of the medium carrying this connection
    pub fn medium(&self) -> &'static str {
        self.inner.medium
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Fault that ended the connection, if any
    pub fn last_error(&self) -> Option<TransportFault> {
        self.inner.status.borrow().last_error.clone()
    }

    pub(crate) fn belongs_to(&self, transport_id: u64) -> bool {
        self.inner.transport_id == transport_id
    }

    /// Queue bytes for the driver
    pub(crate) fn enqueue_send(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.inner
            .commands
            .send(Command::Send(data))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Ask the driver to close and wait until `connection_lost` was delivered.
    /// Returns at once for a connection that already finished.
    pub(crate) async fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
        let mut status = self.inner.status.clone();
        let _ = status.wait_for(|s| s.finished).await;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer)
            .field("medium", &self.inner.medium)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.inner.medium, self.inner.id, self.inner.peer)
    }
}
