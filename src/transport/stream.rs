//! Generic backend for byte-stream media
//!
//! [`StreamTransport`] implements the whole transport contract on top of a
//! [`StreamMedium`]. TCP, TLS, serial and custom media are all instances.

use crate::callbacks::TransportCallbacks;
use crate::connection::{Connection, Listener};
use crate::transport::backend::{open_with_retry, BackendCore, ConnectAttempt, PeerAdmission};
use crate::transport::traits::{LinkReader, LinkWriter, StreamAcceptor, StreamMedium, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use linkwire_shared::{ConnectionState, PeerIdentity, TransportConfig, TransportError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Inbound half of a stream
pub(crate) struct StreamReader<S> {
    inner: ReadHalf<S>,
    buf: Vec<u8>,
}

#[async_trait]
impl<S> LinkReader for StreamReader<S>
where
    S: AsyncRead + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.inner.read(&mut self.buf).await {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outbound half of a stream
pub(crate) struct StreamWriter<S> {
    inner: WriteHalf<S>,
}

#[async_trait]
impl<S> LinkWriter for StreamWriter<S>
where
    S: AsyncWrite + Send + 'static,
{
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Split a stream into the halves a driver owns
pub(crate) fn split_stream<S>(stream: S, read_buffer_size: usize) -> (StreamReader<S>, StreamWriter<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        StreamReader {
            inner: read,
            buf: vec![0u8; read_buffer_size],
        },
        StreamWriter { inner: write },
    )
}

/// Transport over any [`StreamMedium`]
pub struct StreamTransport<M: StreamMedium> {
    medium: M,
    core: BackendCore,
}

impl<M: StreamMedium> StreamTransport<M> {
    /// Create a backend over `medium` reporting to `callbacks`
    pub fn with_medium(medium: M, callbacks: Arc<dyn TransportCallbacks>) -> Self {
        let core = BackendCore::new(medium.name(), callbacks);
        Self { medium, core }
    }
}

impl<M: StreamMedium + Default> StreamTransport<M> {
    pub fn new(callbacks: Arc<dyn TransportCallbacks>) -> Self {
        Self::with_medium(M::default(), callbacks)
    }
}

#[async_trait]
impl<M: StreamMedium> Transport for StreamTransport<M> {
    fn medium(&self) -> &'static str {
        self.core.medium()
    }

    fn setup(&mut self, config: TransportConfig) -> Result<(), TransportError> {
        self.core.ensure_configurable()?;
        self.medium.prepare(&config)?;
        self.core.store(config);
        Ok(())
    }

    async fn start_server(&mut self) -> Result<(), TransportError> {
        let config = self.core.server_config()?;
        let acceptor = self.medium.bind(&config).await?;

        let (mut listener, shutdown) =
            Listener::bound(&config.name, self.core.medium(), acceptor.local_identity());
        let admission = self.core.admission(&config, &listener, M::classify_fault);
        let task = tokio::spawn(accept_loop(
            acceptor,
            shutdown,
            admission,
            config.read_buffer_size,
        ));
        listener.attach(task);
        self.core.listen(listener);
        Ok(())
    }

    async fn connect(&mut self) -> Result<Connection, TransportError> {
        let config = self.core.client_config()?;
        let mut attempt = ConnectAttempt::begin(&config, self.core.medium());

        let medium = &self.medium;
        match open_with_retry(&config, self.core.medium(), || medium.open(&config)).await {
            Ok((stream, peer)) => {
                attempt.established();
                let (reader, writer) = split_stream(stream, config.read_buffer_size);
                Ok(self
                    .core
                    .establish(&config, peer, reader, writer, M::classify_fault))
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

/// Accept peers until the listener signals shutdown.
///
/// Handshakes run in a `JoinSet` so a slow peer cannot stall the others;
/// peers whose handshake fails are dropped without any callback.
async fn accept_loop<A: StreamAcceptor>(
    mut acceptor: A,
    mut shutdown: watch::Receiver<bool>,
    admission: PeerAdmission,
    read_buffer_size: usize,
) {
    let mut handshakes = JoinSet::new();
    let deadline = admission.timeout();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = acceptor.accept() => match accepted {
                Ok((peer, handshake)) => {
                    debug!("[{}] accepted {}", admission.name(), peer);
                    handshakes.spawn(async move { (peer, timeout(deadline, handshake).await) });
                }
                Err(e) => {
                    warn!("[{}] accept failed: {}", admission.name(), e);
                    sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = handshakes.join_next() => match joined {
                Ok((peer, Ok(Ok(stream)))) => {
                    let (reader, writer) = split_stream(stream, read_buffer_size);
                    admission.admit(peer, reader, writer).await;
                }
                Ok((peer, Ok(Err(e)))) => {
                    warn!("[{}] handshake with {} failed: {}", admission.name(), peer, e);
                }
                Ok((peer, Err(_))) => {
                    warn!("[{}] handshake with {} timed out", admission.name(), peer);
                }
                Err(e) => warn!("[{}] handshake task failed: {}", admission.name(), e),
            },
        }
    }

    // Dropping the set aborts handshakes still in flight
    debug!("[{}] accept loop stopped ({} pending handshakes)", admission.name(), handshakes.len());
}
