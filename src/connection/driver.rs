//! Per-connection driver task
//!
//! Every connection, whatever the medium, is run by one driver task. It
//! owns the link halves, processes queued commands in order, and is the
//! only place callbacks for its connection are invoked. That gives the
//! per-connection ordering guarantee for free: `connection_made` is fired
//! before the task starts, `connection_lost` is the last thing it does.

use super::handle::{Command, Connection, DriverParts};
use super::registry::ConnectionRegistry;
use crate::callbacks::TransportCallbacks;
use crate::transport::traits::{LinkReader, LinkWriter};
use bytes::Bytes;
use linkwire_shared::{ConnectionStateMachine, LifecycleEvent, TransportFault};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Everything a driver needs besides its link
#[derive(Clone)]
pub(crate) struct DriverContext {
    pub callbacks: Arc<dyn TransportCallbacks>,
    /// Configured comm name, for log events
    pub name: String,
    /// Bounds each write and the final flush
    pub timeout: Duration,
    /// Registry to leave once closed (server role)
    pub registry: Option<ConnectionRegistry>,
    pub classify: fn(io::Error) -> TransportFault,
    /// Resolves once the owning backend is dropped
    pub owner: watch::Receiver<()>,
}

/// Announce `connection` and spawn its driver.
///
/// Synchronous on purpose: `connection_made` and the spawn happen together
/// or not at all.
pub(crate) fn start<R, W>(
    connection: Connection,
    parts: DriverParts,
    reader: R,
    writer: W,
    ctx: DriverContext,
) -> JoinHandle<()>
where
    R: LinkReader,
    W: LinkWriter,
{
    info!(
        "[{}] {} connection open: {}",
        ctx.name,
        connection.medium(),
        connection.peer()
    );
    ctx.callbacks.connection_made(&connection);

    let driver = Driver {
        connection,
        parts,
        fsm: ConnectionStateMachine::accepted(),
        ctx,
    };
    tokio::spawn(driver.run(reader, writer))
}

struct Driver {
    connection: Connection,
    parts: DriverParts,
    fsm: ConnectionStateMachine,
    ctx: DriverContext,
}

impl Driver {
    async fn run<R: LinkReader, W: LinkWriter>(mut self, mut reader: R, mut writer: W) {
        let (event, fault) = self.exchange(&mut reader, &mut writer).await;

        self.transition(event, fault.clone());
        let discarded = self.drain_commands();
        if discarded > 0 {
            debug!(
                "[{}] {} discarded {} queued send(s) on teardown",
                self.ctx.name, self.connection, discarded
            );
        }

        drop(reader);
        match timeout(self.ctx.timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[{}] {} shutdown: {}", self.ctx.name, self.connection, e),
            Err(_) => warn!("[{}] {} flush timed out", self.ctx.name, self.connection),
        }
        drop(writer);

        self.transition(LifecycleEvent::TeardownComplete, fault.clone());
        if let Some(registry) = &self.ctx.registry {
            registry.unregister(&self.connection).await;
        }

        match &fault {
            Some(f) => warn!("[{}] {} lost: {}", self.ctx.name, self.connection, f),
            None => info!("[{}] {} closed", self.ctx.name, self.connection),
        }
        self.ctx.callbacks.connection_lost(&self.connection, fault);
        self.parts.status.send_modify(|s| s.finished = true);
    }

    /// Exchange data until something ends the connection
    async fn exchange<R: LinkReader, W: LinkWriter>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> (LifecycleEvent, Option<TransportFault>) {
        loop {
            tokio::select! {
                command = self.parts.commands.recv() => match command {
                    Some(Command::Send(data)) => {
                        match self.write(writer, &data).await {
                            Ok(()) => self.ctx.callbacks.data_sent(&self.connection, None),
                            Err(fault) => {
                                self.ctx.callbacks.data_sent(&self.connection, Some(fault.clone()));
                                return (LifecycleEvent::MediumFailed, Some(fault));
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        return (LifecycleEvent::CloseRequested, None);
                    }
                },

                _ = self.ctx.owner.changed() => {
                    debug!("[{}] {} owner dropped", self.ctx.name, self.connection);
                    return (LifecycleEvent::CloseRequested, None);
                }

                inbound = reader.recv() => match inbound {
                    Ok(Some(data)) => {
                        debug!("[{}] {} received {} bytes", self.ctx.name, self.connection, data.len());
                        self.ctx.callbacks.data_received(&self.connection, data);
                    }
                    Ok(None) => return (LifecycleEvent::RemoteClosed, None),
                    Err(e) => return (LifecycleEvent::MediumFailed, Some((self.ctx.classify)(e))),
                }
            }
        }
    }

    async fn write<W: LinkWriter>(&self, writer: &mut W, data: &Bytes) -> Result<(), TransportFault> {
        if data.is_empty() {
            return Ok(());
        }
        match timeout(self.ctx.timeout, writer.send(data)).await {
            Ok(Ok(())) => {
                debug!("[{}] {} sent {} bytes", self.ctx.name, self.connection, data.len());
                Ok(())
            }
            Ok(Err(e)) => Err((self.ctx.classify)(e)),
            Err(_) => Err(TransportFault::Timeout),
        }
    }

    /// Stop accepting commands; sends still queued are dropped
    /// (`connection_lost` stands in for their `data_sent`)
    fn drain_commands(&mut self) -> usize {
        self.parts.commands.close();
        let mut discarded = 0;
        while let Ok(command) = self.parts.commands.try_recv() {
            if let Command::Send(_) = command {
                discarded += 1;
            }
        }
        discarded
    }

    fn transition(&mut self, event: LifecycleEvent, fault: Option<TransportFault>) {
        let result = self.fsm.process_event(event);
        if !result.is_success() {
            warn!("[{}] {} rejected transition: {:?}", self.ctx.name, self.connection, result);
            return;
        }
        let state = self.fsm.state();
        self.parts.status.send_modify(|s| {
            s.state = state;
            s.last_error = fault;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::TransportEvent;
    use crate::connection::ConnectionRole;
    use crate::test_support::recorder;
    use async_trait::async_trait;
    use linkwire_shared::{ConnectionState, PeerIdentity};
    use tokio::sync::mpsc;

    /// Reader fed from a channel of scripted results
    struct ScriptedReader(mpsc::UnboundedReceiver<io::Result<Option<Bytes>>>);

    #[async_trait]
    impl LinkReader for ScriptedReader {
        async fn recv(&mut self) -> io::Result<Option<Bytes>> {
            match self.0.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    /// Writer recording everything, failing on demand
    struct RecordingWriter {
        written: mpsc::UnboundedSender<Vec<u8>>,
        fail_with: Option<io::ErrorKind>,
    }

    #[async_trait]
    impl LinkWriter for RecordingWriter {
        async fn send(&mut self, data: &[u8]) -> io::Result<()> {
            if let Some(kind) = self.fail_with {
                return Err(io::Error::from(kind));
            }
            let _ = self.written.send(data.to_vec());
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        connection: Connection,
        inbound: mpsc::UnboundedSender<io::Result<Option<Bytes>>>,
        written: mpsc::UnboundedReceiver<Vec<u8>>,
        handle: JoinHandle<()>,
        owner: watch::Sender<()>,
    }

    fn start_scripted(
        callbacks: Arc<dyn TransportCallbacks>,
        fail_with: Option<io::ErrorKind>,
        registry: Option<ConnectionRegistry>,
    ) -> Harness {
        let (connection, parts) = Connection::new(
            1,
            ConnectionRole::AcceptedPeer,
            PeerIdentity::Named("scripted".into()),
            "Test",
        );
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written) = mpsc::unbounded_channel();
        let (owner, owner_rx) = watch::channel(());
        let ctx = DriverContext {
            callbacks,
            name: "test".into(),
            timeout: Duration::from_secs(1),
            registry,
            classify: TransportFault::from,
            owner: owner_rx,
        };
        let handle = start(
            connection.clone(),
            parts,
            ScriptedReader(inbound_rx),
            RecordingWriter {
                written: written_tx,
                fail_with,
            },
            ctx,
        );
        Harness {
            connection,
            inbound,
            written,
            handle,
            owner,
        }
    }

    #[tokio::test]
    async fn test_made_fires_before_data() {
        let (callbacks, mut log) = recorder();
        let harness = start_scripted(callbacks, None, None);

        harness.inbound.send(Ok(Some(Bytes::from_static(b"abc")))).unwrap();

        let made = log.expect_made().await;
        assert_eq!(made, harness.connection);
        let (_, data) = log.expect_received().await;
        assert_eq!(&data[..], b"abc");
    }

    #[tokio::test]
    async fn test_sends_are_written_in_order() {
        let (callbacks, mut log) = recorder();
        let mut harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        for chunk in [&b"one"[..], b"two", b"three"] {
            harness.connection.enqueue_send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        for expected in [&b"one"[..], b"two", b"three"] {
            assert_eq!(harness.written.recv().await.unwrap(), expected);
            let (_, error) = log.expect_sent().await;
            assert!(error.is_none());
        }
    }

    #[tokio::test]
    async fn test_empty_send_still_reports_sent() {
        let (callbacks, mut log) = recorder();
        let mut harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        harness.connection.enqueue_send(Bytes::new()).unwrap();
        let (_, error) = log.expect_sent().await;
        assert!(error.is_none());
        assert!(harness.written.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_is_clean() {
        let (callbacks, mut log) = recorder();
        let harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        harness.inbound.send(Ok(None)).unwrap();
        let (_, error) = log.expect_lost().await;
        assert!(error.is_none());
        harness.handle.await.unwrap();
        assert_eq!(harness.connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_read_error_is_reported_as_fault() {
        let (callbacks, mut log) = recorder();
        let harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        harness
            .inbound
            .send(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            .unwrap();
        let (_, error) = log.expect_lost().await;
        assert_eq!(error, Some(TransportFault::Reset));
        harness.handle.await.unwrap();
        assert_eq!(harness.connection.last_error(), Some(TransportFault::Reset));
    }

    #[tokio::test]
    async fn test_write_error_reports_sent_then_lost() {
        let (callbacks, mut log) = recorder();
        let harness = start_scripted(callbacks, Some(io::ErrorKind::BrokenPipe), None);
        log.expect_made().await;

        harness.connection.enqueue_send(Bytes::from_static(b"x")).unwrap();
        let (_, sent_error) = log.expect_sent().await;
        assert_eq!(sent_error, Some(TransportFault::Reset));
        let (_, lost_error) = log.expect_lost().await;
        assert_eq!(lost_error, Some(TransportFault::Reset));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (callbacks, mut log) = recorder();
        let harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        harness.connection.close().await;
        harness.connection.close().await;

        let (_, error) = log.expect_lost().await;
        assert!(error.is_none());
        log.assert_quiet().await;
        assert!(matches!(
            harness.connection.enqueue_send(Bytes::from_static(b"late")),
            Err(linkwire_shared::TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_queued_sends_flush_before_close() {
        let (callbacks, mut log) = recorder();
        let mut harness = start_scripted(callbacks, None, None);
        log.expect_made().await;

        harness.connection.enqueue_send(Bytes::from_static(b"last words")).unwrap();
        harness.connection.close().await;

        assert_eq!(harness.written.recv().await.unwrap(), b"last words");
        let events = log.drain();
        assert!(matches!(events[0], TransportEvent::DataSent { error: None, .. }));
        assert!(matches!(events[1], TransportEvent::ConnectionLost { error: None, .. }));
    }

    #[tokio::test]
    async fn test_leaves_registry_before_lost() {
        let (callbacks, mut log) = recorder();
        let registry = ConnectionRegistry::new();
        let harness = start_scripted(callbacks, None, Some(registry.clone()));
        registry.register(harness.connection.clone()).await;
        log.expect_made().await;
        assert_eq!(registry.count().await, 1);

        harness.inbound.send(Ok(None)).unwrap();
        log.expect_lost().await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_owner_drop_closes_connection() {
        let (callbacks, mut log) = recorder();
        let registry = ConnectionRegistry::new();
        let harness = start_scripted(callbacks, None, Some(registry.clone()));
        registry.register(harness.connection.clone()).await;
        log.expect_made().await;

        drop(harness.owner);

        let (lost, error) = log.expect_lost().await;
        assert_eq!(lost, harness.connection);
        assert!(error.is_none());
        harness.handle.await.unwrap();
        assert_eq!(harness.connection.state(), ConnectionState::Closed);
        assert_eq!(registry.count().await, 0);
    }
}
