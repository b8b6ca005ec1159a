//! In-memory null-modem medium
//!
//! Named endpoints on a shared switchboard are wired together with
//! `tokio::io::duplex`. Plug it into [`CustomTransport`] to run the full
//! transport contract without touching the network.

use crate::transport::stream::StreamTransport;
use crate::transport::traits::{Handshake, StreamAcceptor, StreamMedium};
use async_trait::async_trait;
use futures::future;
use linkwire_shared::{
    BindError, BindErrorKind, ConnectError, ConnectErrorKind, MediumKind, PeerIdentity,
    TransportConfig,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

/// Bytes buffered in each direction of a link
const LINK_CAPACITY: usize = 64 * 1024;

/// Any [`StreamMedium`] run through the generic stream backend
pub type CustomTransport<M> = StreamTransport<M>;

type Switchboard = HashMap<String, mpsc::UnboundedSender<(PeerIdentity, DuplexStream)>>;

/// Shared switchboard of named in-memory endpoints
///
/// Clones share the switchboard, so a server and a client built from clones
/// of the same modem can reach each other.
#[derive(Clone, Default)]
pub struct NullModem {
    endpoints: Arc<Mutex<Switchboard>>,
    next_link: Arc<AtomicU64>,
}

impl NullModem {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamMedium for NullModem {
    type Stream = DuplexStream;
    type Acceptor = NullModemAcceptor;

    fn kind(&self) -> MediumKind {
        MediumKind::Custom
    }

    fn name(&self) -> &'static str {
        "NullModem"
    }

    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(DuplexStream, PeerIdentity), ConnectError> {
        let mut endpoints = self.endpoints.lock().await;
        let route = endpoints.get(&config.endpoint).ok_or_else(|| {
            ConnectError::new(
                &config.endpoint,
                ConnectErrorKind::Refused,
                "no endpoint listening",
            )
        })?;

        let link = self.next_link.fetch_add(1, Ordering::Relaxed) + 1;
        let caller = PeerIdentity::Named(format!("{}#{}", config.endpoint, link));
        let (local, remote) = tokio::io::duplex(LINK_CAPACITY);

        if route.send((caller, remote)).is_err() {
            // Listener went away without unregistering
            endpoints.remove(&config.endpoint);
            return Err(ConnectError::new(
                &config.endpoint,
                ConnectErrorKind::Refused,
                "endpoint closed",
            ));
        }
        Ok((local, PeerIdentity::Named(config.endpoint.clone())))
    }

    async fn bind(&self, config: &TransportConfig) -> Result<NullModemAcceptor, BindError> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(existing) = endpoints.get(&config.endpoint) {
            if !existing.is_closed() {
                return Err(BindError::new(
                    &config.endpoint,
                    BindErrorKind::AddressInUse,
                    "endpoint already bound",
                ));
            }
        }

        let (route, incoming) = mpsc::unbounded_channel();
        endpoints.insert(config.endpoint.clone(), route);
        Ok(NullModemAcceptor {
            name: config.endpoint.clone(),
            incoming,
        })
    }
}

/// Bound null-modem endpoint
pub struct NullModemAcceptor {
    name: String,
    incoming: mpsc::UnboundedReceiver<(PeerIdentity, DuplexStream)>,
}

#[async_trait]
impl StreamAcceptor for NullModemAcceptor {
    type Stream = DuplexStream;

    fn local_identity(&self) -> PeerIdentity {
        PeerIdentity::Named(self.name.clone())
    }

    async fn accept(&mut self) -> io::Result<(PeerIdentity, Handshake<DuplexStream>)> {
        match self.incoming.recv().await {
            Some((peer, stream)) => {
                let ready: Handshake<DuplexStream> = Box::pin(future::ready(Ok(stream)));
                Ok((peer, ready))
            }
            None => future::pending().await,
        }
    }
}
