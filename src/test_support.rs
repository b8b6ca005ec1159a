//! Helpers shared by the in-crate tests

use crate::callbacks::{ChannelCallbacks, TransportEvent};
use crate::connection::Connection;
use bytes::{Bytes, BytesMut};
use linkwire_shared::TransportFault;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks that record into an [`EventLog`]
pub fn recorder() -> (Arc<ChannelCallbacks>, EventLog) {
    let (callbacks, events) = ChannelCallbacks::new();
    (callbacks, EventLog { events })
}

pub struct EventLog {
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventLog {
    pub async fn next(&mut self) -> TransportEvent {
        match timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("callback channel closed"),
            Err(_) => panic!("no callback within {:?}", EVENT_TIMEOUT),
        }
    }

    pub async fn expect_made(&mut self) -> Connection {
        match self.next().await {
            TransportEvent::ConnectionMade(connection) => connection,
            other => panic!("expected connection_made, got {:?}", other),
        }
    }

    pub async fn expect_received(&mut self) -> (Connection, Bytes) {
        match self.next().await {
            TransportEvent::DataReceived { connection, data } => (connection, data),
            other => panic!("expected data_received, got {:?}", other),
        }
    }

    pub async fn expect_sent(&mut self) -> (Connection, Option<TransportFault>) {
        match self.next().await {
            TransportEvent::DataSent { connection, error } => (connection, error),
            other => panic!("expected data_sent, got {:?}", other),
        }
    }

    pub async fn expect_lost(&mut self) -> (Connection, Option<TransportFault>) {
        match self.next().await {
            TransportEvent::ConnectionLost { connection, error } => (connection, error),
            other => panic!("expected connection_lost, got {:?}", other),
        }
    }

    /// Concatenate `data_received` payloads until `len` bytes arrived.
    /// `data_sent` events in between are skipped.
    pub async fn collect_received(&mut self, len: usize) -> Bytes {
        let mut buf = BytesMut::new();
        while buf.len() < len {
            match self.next().await {
                TransportEvent::DataReceived { data, .. } => buf.extend_from_slice(&data),
                TransportEvent::DataSent { .. } => {}
                other => panic!("expected data_received, got {:?}", other),
            }
        }
        buf.freeze()
    }

    /// Everything delivered so far
    pub fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Assert nothing else arrives for a short while
    pub async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let extra = self.drain();
        assert!(extra.is_empty(), "unexpected callbacks: {:?}", extra);
    }
}
