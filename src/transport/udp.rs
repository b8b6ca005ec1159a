//! UDP datagram transport
//!
//! Client role uses a connected socket; the connection opens immediately.
//! Server role binds one socket and demultiplexes datagrams by source
//! address, each new source becoming an accepted peer. A peer that sends
//! nothing for the configured idle timeout is closed.

use crate::callbacks::TransportCallbacks;
use crate::connection::{Connection, Listener};
use crate::transport::backend::{open_with_retry, BackendCore, ConnectAttempt, PeerAdmission};
use crate::transport::traits::{LinkReader, LinkWriter, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use linkwire_shared::{
    BindError, ConnectError, ConnectErrorKind, ConnectionState, MediumKind, PeerIdentity,
    TransportConfig, TransportError, TransportFault,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Largest UDP payload; every datagram is delivered whole
const MAX_DATAGRAM: usize = 65_535;

/// ICMP port-unreachable and friends surface as these on a UDP socket
fn is_icmp_noise(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Reads datagrams from a connected client socket
struct DatagramReader {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

#[async_trait]
impl LinkReader for DatagramReader {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.socket.recv(&mut self.buf).await {
                Ok(0) => continue,
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) if is_icmp_noise(&e) => {
                    debug!("UDP ignoring {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Datagrams routed to one peer by the server's demultiplexer
struct PeerDatagramReader {
    datagrams: mpsc::UnboundedReceiver<Bytes>,
    idle: Duration,
    deadline: Instant,
}

impl PeerDatagramReader {
    fn new(datagrams: mpsc::UnboundedReceiver<Bytes>, idle: Duration) -> Self {
        Self {
            datagrams,
            idle,
            deadline: Instant::now() + idle,
        }
    }
}

#[async_trait]
impl LinkReader for PeerDatagramReader {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match timeout_at(self.deadline, self.datagrams.recv()).await {
            Ok(Some(data)) => {
                self.deadline = Instant::now() + self.idle;
                Ok(Some(data))
            }
            Ok(None) => Ok(None),
            Err(_) => {
                // Closing the route sends later datagrams to a fresh peer;
                // whatever is already queued is still delivered
                self.datagrams.close();
                Ok(self.datagrams.recv().await)
            }
        }
    }
}

/// Writes one datagram per send
struct DatagramWriter {
    socket: Arc<UdpSocket>,
    /// Destination on a shared server socket; `None` for a connected socket
    peer: Option<SocketAddr>,
}

#[async_trait]
impl LinkWriter for DatagramWriter {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut retried = false;
        let written = loop {
            let result = match self.peer {
                Some(peer) => self.socket.send_to(data, peer).await,
                None => self.socket.send(data).await,
            };
            match result {
                Ok(n) => break n,
                // A pending ICMP report consumes the call; the datagram was not sent
                Err(e) if is_icmp_noise(&e) && !retried => {
                    debug!("UDP ignoring {} on send", e);
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        };
        if written != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: {} of {} bytes", written, data.len()),
            ));
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn open_socket(config: &TransportConfig) -> Result<(UdpSocket, SocketAddr), ConnectError> {
    let target = lookup_host(&config.endpoint)
        .await
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?
        .next()
        .ok_or_else(|| {
            ConnectError::new(
                &config.endpoint,
                ConnectErrorKind::Unreachable,
                "endpoint did not resolve",
            )
        })?;

    let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?;
    socket
        .connect(target)
        .await
        .map_err(|e| ConnectError::from_io(&config.endpoint, &e))?;
    Ok((socket, target))
}

/// Transport over UDP
pub struct UdpTransport {
    core: BackendCore,
}

impl UdpTransport {
    pub fn new(callbacks: Arc<dyn TransportCallbacks>) -> Self {
        Self {
            core: BackendCore::new("UDP", callbacks),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn medium(&self) -> &'static str {
        self.core.medium()
    }

    fn setup(&mut self, config: TransportConfig) -> Result<(), TransportError> {
        self.core.ensure_configurable()?;
        config.validate_for(MediumKind::Udp)?;
        self.core.store(config);
        Ok(())
    }

    async fn start_server(&mut self) -> Result<(), TransportError> {
        let config = self.core.server_config()?;
        let socket = UdpSocket::bind(&config.endpoint)
            .await
            .map_err(|e| BindError::from_io(&config.endpoint, &e))?;
        let local = socket
            .local_addr()
            .map_err(|e| BindError::from_io(&config.endpoint, &e))?;

        let (mut listener, shutdown) = Listener::bound(&config.name, self.core.medium(), local.into());
        let admission = self.core.admission(&config, &listener, TransportFault::from);
        let task = tokio::spawn(demux_loop(
            Arc::new(socket),
            shutdown,
            admission,
            config.idle_timeout,
        ));
        listener.attach(task);
        self.core.listen(listener);
        Ok(())
    }

    async fn connect(&mut self) -> Result<Connection, TransportError> {
        let config = self.core.client_config()?;
        let mut attempt = ConnectAttempt::begin(&config, self.core.medium());

        match open_with_retry(&config, self.core.medium(), || open_socket(&config)).await {
            Ok((socket, target)) => {
                attempt.established();
                let socket = Arc::new(socket);
                let reader = DatagramReader {
                    socket: socket.clone(),
                    buf: vec![0u8; MAX_DATAGRAM],
                };
                let writer = DatagramWriter { socket, peer: None };
                Ok(self
                    .core
                    .establish(&config, target.into(), reader, writer, TransportFault::from))
            }
            Err(e) => {
                attempt.failed(&e);
                Err(e.into())
            }
        }
    }

    async fn send(&self, connection: &Connection, data: Bytes) -> Result<(), TransportError> {
        self.core.send(connection, data)
    }

    async fn disconnect(&mut self, connection: Option<&Connection>) {
        self.core.disconnect(connection).await
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    async fn connections(&self) -> Vec<Connection> {
        self.core.connections().await
    }

    fn local_identity(&self) -> Option<PeerIdentity> {
        self.core.local_identity()
    }
}

/// Route datagrams from the shared server socket to per-peer connections
async fn demux_loop(
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
    admission: PeerAdmission,
    idle: Duration,
) {
    let mut peers: HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            received = socket.recv_from(&mut buf) => match received {
                Ok((0, _)) => {}
                Ok((n, from)) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    // Known peer whose connection is still reading
                    let data = match peers.get(&from) {
                        Some(route) => match route.send(data) {
                            Ok(()) => continue,
                            Err(mpsc::error::SendError(data)) => data,
                        },
                        None => data,
                    };

                    peers.retain(|_, route| !route.is_closed());
                    let (route, datagrams) = mpsc::unbounded_channel();
                    let _ = route.send(data);
                    peers.insert(from, route);

                    debug!("[{}] UDP new peer {}", admission.name(), from);
                    let reader = PeerDatagramReader::new(datagrams, idle);
                    let writer = DatagramWriter {
                        socket: socket.clone(),
                        peer: Some(from),
                    };
                    admission.admit(from.into(), reader, writer).await;
                }
                Err(e) if is_icmp_noise(&e) => debug!("[{}] UDP ignoring {}", admission.name(), e),
                Err(e) => warn!("[{}] UDP receive failed: {}", admission.name(), e),
            },
        }
    }

    debug!("[{}] UDP demultiplexer stopped ({} routes)", admission.name(), peers.len());
}
