//! TCP transport implementation

use crate::transport::stream::StreamTransport;
use crate::transport::traits::{Handshake, StreamAcceptor, StreamMedium};
use async_trait::async_trait;
use futures::future;
use linkwire_shared::{BindError, ConnectError, MediumKind, PeerIdentity, TransportConfig};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Open a TCP stream to the configured endpoint with `TCP_NODELAY` set
pub(crate) async fn connect_tcp(
    config: &TransportConfig,
) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let stream = TcpStream::connect(&config.endpoint)
        .await
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?;
    let peer = stream
        .peer_addr()
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?;
    Ok((stream, peer))
}

/// Bind a TCP listener on the configured endpoint
pub(crate) async fn bind_tcp(config: &TransportConfig) -> Result<(TcpListener, SocketAddr), BindError> {
    let listener = TcpListener::bind(&config.endpoint)
        .await
        .map_err(|e| BindError::from_io(&config.endpoint, &e))?;
    let local = listener
        .local_addr()
        .map_err(|e| BindError::from_io(&config.endpoint, &e))?;
    Ok((listener, local))
}

/// Accept the next TCP peer with `TCP_NODELAY` set
pub(crate) async fn accept_tcp(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP_NODELAY on {}: {}", addr, e);
    }
    Ok((stream, addr))
}

/// Plain TCP medium
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpMedium;

#[async_trait]
impl StreamMedium for TcpMedium {
    type Stream = TcpStream;
    type Acceptor = TcpAcceptor;

    fn kind(&self) -> MediumKind {
        MediumKind::Tcp
    }

    fn name(&self) -> &'static str {
        "TCP"
    }

    async fn open(&self, config: &TransportConfig) -> Result<(TcpStream, PeerIdentity), ConnectError> {
        let (stream, peer) = connect_tcp(config).await?;
        Ok((stream, peer.into()))
    }

    async fn bind(&self, config: &TransportConfig) -> Result<TcpAcceptor, BindError> {
        let (listener, local) = bind_tcp(config).await?;
        Ok(TcpAcceptor { listener, local })
    }
}

/// Bound TCP listener
pub struct TcpAcceptor {
    listener: TcpListener,
    local: SocketAddr,
}

#[async_trait]
impl StreamAcceptor for TcpAcceptor {
    type Stream = TcpStream;

    fn local_identity(&self) -> PeerIdentity {
        self.local.into()
    }

    async fn accept(&mut self) -> io::Result<(PeerIdentity, Handshake<TcpStream>)> {
        let (stream, addr) = accept_tcp(&self.listener).await?;
        let ready: Handshake<TcpStream> = Box::pin(future::ready(Ok(stream)));
        Ok((addr.into(), ready))
    }
}

/// Transport over plain TCP
pub type TcpTransport = StreamTransport<TcpMedium>;
