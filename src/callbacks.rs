//! Callback contract between a transport and its owner
//!
//! A backend reports lifecycle and data events through
//! [`TransportCallbacks`]. For one connection the calls are strictly
//! ordered: `connection_made`, then any mix of `data_received` and
//! `data_sent`, then exactly one `connection_lost`.
//!
//! The methods are synchronous. A callback that wants to react with another
//! transport operation has to queue it; [`ChannelCallbacks`] does that by
//! turning every callback into a [`TransportEvent`] on a tokio channel.

use crate::connection::Connection;
use bytes::Bytes;
use linkwire_shared::TransportFault;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications a transport delivers to its owner
pub trait TransportCallbacks: Send + Sync + 'static {
    /// A connection is ready for `send`. Fired once, before any other
    /// callback for `connection`.
    fn connection_made(&self, connection: &Connection);

    /// A non-empty chunk arrived, exactly as read from the medium.
    fn data_received(&self, connection: &Connection, data: Bytes);

    /// One `send` request completed. `error` is set when the medium did
    /// not take the bytes.
    fn data_sent(&self, connection: &Connection, error: Option<TransportFault>);

    /// Terminal event. `error` is `None` for a clean close.
    fn connection_lost(&self, connection: &Connection, error: Option<TransportFault>);
}

/// Events emitted by [`ChannelCallbacks`]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionMade(Connection),
    DataReceived {
        connection: Connection,
        data: Bytes,
    },
    DataSent {
        connection: Connection,
        error: Option<TransportFault>,
    },
    ConnectionLost {
        connection: Connection,
        error: Option<TransportFault>,
    },
}

impl TransportEvent {
    /// The connection this event is about
    pub fn connection(&self) -> &Connection {
        match self {
            TransportEvent::ConnectionMade(connection)
            | TransportEvent::DataReceived { connection, .. }
            | TransportEvent::DataSent { connection, .. }
            | TransportEvent::ConnectionLost { connection, .. } => connection,
        }
    }
}

/// Callback adapter that forwards every notification into a channel
///
/// Lets the owner drive the transport from a plain event loop instead of
/// from inside callbacks.
pub struct ChannelCallbacks {
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelCallbacks {
    /// Create the adapter and the receiving end of its event channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { event_tx }), event_rx)
    }

    fn emit(&self, event: TransportEvent) {
        // Owner went away; nothing left to notify
        let _ = self.event_tx.send(event);
    }
}

impl TransportCallbacks for ChannelCallbacks {
    fn connection_made(&self, connection: &Connection) {
        self.emit(TransportEvent::ConnectionMade(connection.clone()));
    }

    fn data_received(&self, connection: &Connection, data: Bytes) {
        self.emit(TransportEvent::DataReceived {
            connection: connection.clone(),
            data,
        });
    }

    fn data_sent(&self, connection: &Connection, error: Option<TransportFault>) {
        self.emit(TransportEvent::DataSent {
            connection: connection.clone(),
            error,
        });
    }

    fn connection_lost(&self, connection: &Connection, error: Option<TransportFault>) {
        self.emit(TransportEvent::ConnectionLost {
            connection: connection.clone(),
            error,
        });
    }
}
