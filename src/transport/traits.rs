//! Transport trait abstraction for pluggable communication backends

use crate::connection::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use linkwire_shared::{
    BindError, ConnectError, ConnectionState, MediumKind, PeerIdentity, TransportConfig,
    TransportError, TransportFault,
};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// The contract every backend implements
///
/// The owner drives a backend through `setup` then `start_server` (server
/// role) or `connect` (client role), and is told about everything else
/// through its [`TransportCallbacks`](crate::TransportCallbacks).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name of the medium
    fn medium(&self) -> &'static str;

    /// Validate and store configuration. Rejected while the backend is active.
    fn setup(&mut self, config: TransportConfig) -> Result<(), TransportError>;

    /// Bind and start accepting peers. Returns once bound.
    async fn start_server(&mut self) -> Result<(), TransportError>;

    /// Open the client connection. `connection_made` has fired by the time
    /// this returns `Ok`.
    async fn connect(&mut self) -> Result<Connection, TransportError>;

    /// Queue bytes on an open connection. Exactly one `data_sent` follows an
    /// `Ok` return unless the connection is torn down first.
    async fn send(&self, connection: &Connection, data: Bytes) -> Result<(), TransportError>;

    /// Tear down one connection, or the whole backend when `None`.
    /// Idempotent; returns after `connection_lost` was delivered.
    async fn disconnect(&mut self, connection: Option<&Connection>);

    /// State of the backend's endpoint
    fn state(&self) -> ConnectionState;

    /// Live connections (registry in server role, the client connection otherwise)
    async fn connections(&self) -> Vec<Connection>;

    /// Bound or local endpoint, when known
    fn local_identity(&self) -> Option<PeerIdentity>;
}

/// Inbound half of a link, driven by the connection driver
#[async_trait]
pub trait LinkReader: Send + 'static {
    /// Next non-empty inbound chunk, `Ok(None)` on a clean end of stream.
    /// Must be cancel safe: it is polled inside `select!`.
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Outbound half of a link, driven by the connection driver
#[async_trait]
pub trait LinkWriter: Send + 'static {
    /// Hand all of `data` to the medium
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and release the outbound side
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Completes a peer's handshake (if the medium has one) off the accept path
pub type Handshake<S> = BoxFuture<'static, io::Result<S>>;

/// A bound endpoint producing inbound byte streams
#[async_trait]
pub trait StreamAcceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Local endpoint this acceptor is bound to
    fn local_identity(&self) -> PeerIdentity;

    /// Wait for the next peer. Must be cancel safe.
    async fn accept(&mut self) -> io::Result<(PeerIdentity, Handshake<Self::Stream>)>;
}

/// A byte-stream medium pluggable into [`StreamTransport`](crate::transport::StreamTransport)
///
/// Implementing this is all a custom backend needs: the generic stream
/// backend supplies the lifecycle, callbacks and registry.
#[async_trait]
pub trait StreamMedium: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;
    type Acceptor: StreamAcceptor<Stream = Self::Stream>;

    /// Used for config validation
    fn kind(&self) -> MediumKind;

    /// Human-readable name for this medium
    fn name(&self) -> &'static str;

    /// Validate configuration and pre-build anything derived from it
    fn prepare(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        config.validate_for(self.kind())
    }

    /// Open a client stream (including any handshake)
    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(Self::Stream, PeerIdentity), ConnectError>;

    /// Claim the server endpoint
    async fn bind(&self, config: &TransportConfig) -> Result<Self::Acceptor, BindError>;

    /// Map an I/O error on an open stream to a fault
    fn classify_fault(err: io::Error) -> TransportFault
    where
        Self: Sized,
    {
        TransportFault::from(err)
    }
}
