//! State and bookkeeping shared by every backend
//!
//! A backend is a medium plus a [`BackendCore`]: the core holds the
//! configuration, the client slot or listener, and implements the parts of
//! the transport contract that do not depend on the medium.

use crate::callbacks::TransportCallbacks;
use crate::connection::driver::{self, DriverContext};
use crate::connection::{Connection, ConnectionRegistry, ConnectionRole, Listener};
use crate::transport::traits::{LinkReader, LinkWriter};
use bytes::Bytes;
use linkwire_shared::{
    ConnectError, ConnectErrorKind, ConnectionState, PeerIdentity, Role, TransportConfig,
    TransportError, TransportFault,
};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// What the backend's endpoint currently is
enum Endpoint {
    Idle,
    Client(Connection),
    Listening(Listener),
}

/// Backend state; dropping it closes every connection it produced
pub(crate) struct BackendCore {
    id: u64,
    medium: &'static str,
    callbacks: Arc<dyn TransportCallbacks>,
    config: Option<TransportConfig>,
    endpoint: Endpoint,
    /// Drivers watch this; it is never written, only dropped
    owner: watch::Sender<()>,
}

impl BackendCore {
    pub fn new(medium: &'static str, callbacks: Arc<dyn TransportCallbacks>) -> Self {
        Self {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            medium,
            callbacks,
            config: None,
            endpoint: Endpoint::Idle,
            owner: watch::channel(()).0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn medium(&self) -> &'static str {
        self.medium
    }

    fn is_active(&self) -> bool {
        match &self.endpoint {
            Endpoint::Idle => false,
            Endpoint::Client(connection) => connection.state().is_live(),
            Endpoint::Listening(_) => true,
        }
    }

    /// Fails unless a new configuration may be stored
    pub fn ensure_configurable(&self) -> Result<(), TransportError> {
        if self.is_active() {
            return Err(TransportError::config(format!(
                "{} backend is active; disconnect before reconfiguring",
                self.medium
            )));
        }
        Ok(())
    }

    /// Store an already validated configuration
    pub fn store(&mut self, config: TransportConfig) {
        debug!(
            "[{}] {} configured: {} {}",
            config.name, self.medium, config.role, config.endpoint
        );
        self.config = Some(config);
        self.endpoint = Endpoint::Idle;
    }

    fn configured(&self, role: Role) -> Result<TransportConfig, TransportError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| TransportError::config("setup() has not been called"))?;
        if config.role != role {
            return Err(TransportError::config(format!(
                "operation requires {} role, configured as {}",
                role, config.role
            )));
        }
        Ok(config.clone())
    }

    /// Configuration for a connect attempt
    pub fn client_config(&self) -> Result<TransportConfig, TransportError> {
        let config = self.configured(Role::Client)?;
        if self.is_active() {
            return Err(ConnectError::new(
                &config.endpoint,
                ConnectErrorKind::InvalidState,
                "a connection is already open",
            )
            .into());
        }
        Ok(config)
    }

    /// Configuration for starting a listener
    pub fn server_config(&self) -> Result<TransportConfig, TransportError> {
        let config = self.configured(Role::Server)?;
        if self.is_active() {
            return Err(TransportError::config(format!(
                "{} backend is already listening",
                self.medium
            )));
        }
        Ok(config)
    }

    pub fn driver_context(
        &self,
        config: &TransportConfig,
        registry: Option<ConnectionRegistry>,
        classify: fn(io::Error) -> TransportFault,
    ) -> DriverContext {
        DriverContext {
            callbacks: self.callbacks.clone(),
            name: config.name.clone(),
            timeout: config.timeout,
            registry,
            classify,
            owner: self.owner.subscribe(),
        }
    }

    /// Install the client connection and start its driver.
    ///
    /// No suspension point: the connection is either fully established or
    /// not at all.
    pub fn establish<R, W>(
        &mut self,
        config: &TransportConfig,
        peer: PeerIdentity,
        reader: R,
        writer: W,
        classify: fn(io::Error) -> TransportFault,
    ) -> Connection
    where
        R: LinkReader,
        W: LinkWriter,
    {
        let (connection, parts) = Connection::new(self.id, ConnectionRole::Client, peer, self.medium);
        let ctx = self.driver_context(config, None, classify);
        driver::start(connection.clone(), parts, reader, writer, ctx);
        self.endpoint = Endpoint::Client(connection.clone());
        connection
    }

    /// Admission handle for peers of `listener`
    pub fn admission(
        &self,
        config: &TransportConfig,
        listener: &Listener,
        classify: fn(io::Error) -> TransportFault,
    ) -> PeerAdmission {
        let registry = listener.registry().clone();
        PeerAdmission {
            transport_id: self.id,
            medium: self.medium,
            ctx: self.driver_context(config, Some(registry.clone()), classify),
            registry,
        }
    }

    pub fn listen(&mut self, listener: Listener) {
        self.endpoint = Endpoint::Listening(listener);
    }

    pub fn state(&self) -> ConnectionState {
        match &self.endpoint {
            Endpoint::Idle => ConnectionState::Idle,
            Endpoint::Client(connection) => match connection.state() {
                ConnectionState::Closed => ConnectionState::Idle,
                state => state,
            },
            Endpoint::Listening(listener) => listener.state(),
        }
    }

    pub fn send(&self, connection: &Connection, data: Bytes) -> Result<(), TransportError> {
        if !connection.belongs_to(self.id) {
            return Err(TransportError::NotConnected);
        }
        connection.enqueue_send(data)
    }

    pub async fn disconnect(&mut self, connection: Option<&Connection>) {
        match connection {
            Some(connection) => {
                if !connection.belongs_to(self.id) {
                    debug!("{} ignoring disconnect of foreign {}", self.medium, connection);
                    return;
                }
                connection.close().await;
                if matches!(&self.endpoint, Endpoint::Client(client) if client == connection) {
                    self.endpoint = Endpoint::Idle;
                }
            }
            None => match std::mem::replace(&mut self.endpoint, Endpoint::Idle) {
                Endpoint::Idle => {}
                Endpoint::Client(client) => client.close().await,
                Endpoint::Listening(listener) => listener.close().await,
            },
        }
    }

    pub async fn connections(&self) -> Vec<Connection> {
        match &self.endpoint {
            Endpoint::Idle => Vec::new(),
            Endpoint::Client(connection) if connection.state().is_live() => {
                vec![connection.clone()]
            }
            Endpoint::Client(_) => Vec::new(),
            Endpoint::Listening(listener) => listener.registry().connections().await,
        }
    }

    pub fn local_identity(&self) -> Option<PeerIdentity> {
        match &self.endpoint {
            Endpoint::Listening(listener) => Some(listener.local_identity().clone()),
            _ => None,
        }
    }
}

/// Registers accepted peers and starts their drivers
#[derive(Clone)]
pub(crate) struct PeerAdmission {
    transport_id: u64,
    medium: &'static str,
    registry: ConnectionRegistry,
    ctx: DriverContext,
}

impl PeerAdmission {
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn timeout(&self) -> std::time::Duration {
        self.ctx.timeout
    }

    pub async fn admit<R, W>(&self, peer: PeerIdentity, reader: R, writer: W) -> Connection
    where
        R: LinkReader,
        W: LinkWriter,
    {
        let (connection, parts) = Connection::new(
            self.transport_id,
            ConnectionRole::AcceptedPeer,
            peer,
            self.medium,
        );
        self.registry.register(connection.clone()).await;
        driver::start(connection.clone(), parts, reader, writer, self.ctx.clone());
        connection
    }
}

/// Log bookkeeping for one `connect()` call
///
/// An attempt dropped before `established` or `failed` was cancelled by
/// the caller; nothing was installed, so only the log records it.
pub(crate) struct ConnectAttempt<'a> {
    config: &'a TransportConfig,
    medium: &'static str,
    settled: bool,
}

impl<'a> ConnectAttempt<'a> {
    pub fn begin(config: &'a TransportConfig, medium: &'static str) -> Self {
        info!("[{}] {} connecting to {}", config.name, medium, config.endpoint);
        Self {
            config,
            medium,
            settled: false,
        }
    }

    pub fn established(&mut self) {
        self.settled = true;
    }

    pub fn failed(&mut self, err: &ConnectError) {
        self.settled = true;
        warn!("[{}] {} {}", self.config.name, self.medium, err);
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                "[{}] {} connect to {} abandoned",
                self.config.name, self.medium, self.config.endpoint
            );
        }
    }
}

/// Run `attempt` under the configured timeout and retry policy
pub(crate) async fn open_with_retry<T, F, Fut>(
    config: &TransportConfig,
    medium: &'static str,
    mut attempt: F,
) -> Result<T, ConnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectError>>,
{
    let mut retry = 0;
    loop {
        let result = match timeout(config.timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::timeout(&config.endpoint)),
        };

        match result {
            Ok(opened) => return Ok(opened),
            Err(e) if e.kind.is_retryable() && retry < config.retry.max_retries => {
                retry += 1;
                let delay = config.retry.delay_before(retry);
                warn!(
                    "[{}] {} {}; retry {}/{} in {:?}",
                    config.name, medium, e, retry, config.retry.max_retries, delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
