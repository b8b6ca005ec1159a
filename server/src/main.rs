//! linkwire-server: echo server on any medium
//!
//! Environment:
//! - `LINKWIRE_ENDPOINT`: bind address or device path (default `0.0.0.0:5020`)
//! - `LINKWIRE_MEDIUM`: `tcp`, `udp`, `serial` or `tls` (default `tcp`)
//! - `LINKWIRE_TLS_CERT` / `LINKWIRE_TLS_KEY`: PEM files, required for `tls`

use anyhow::{Context, Result};
use linkwire::{create_transport, ChannelCallbacks, Transport, TransportEvent};
use linkwire_shared::{MediumKind, TlsMaterial, TransportConfig};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn read_pem(var: &str) -> Result<Vec<u8>> {
    let path = std::env::var(var).with_context(|| format!("{} is required for tls", var))?;
    std::fs::read(&path).with_context(|| format!("reading {}", path))
}

fn server_config(medium: MediumKind, endpoint: String) -> Result<TransportConfig> {
    let config = TransportConfig::server(endpoint).with_name("echo");
    if medium != MediumKind::Tls {
        return Ok(config);
    }
    let material = TlsMaterial::server(read_pem("LINKWIRE_TLS_CERT")?, read_pem("LINKWIRE_TLS_KEY")?);
    Ok(config.with_tls(material))
}

/// Echo every chunk back to the connection it came from
async fn serve(transport: &mut Box<dyn Transport>, event: TransportEvent) {
    match event {
        TransportEvent::ConnectionMade(conn) => {
            let peers = transport.connections().await.len();
            info!("Peer connected: {} ({} connected)", conn, peers);
        }
        TransportEvent::DataReceived { connection, data } => {
            debug!("{} bytes from {}", data.len(), connection.peer());
            if let Err(e) = transport.send(&connection, data).await {
                warn!("Echo to {} failed: {}", connection, e);
            }
        }
        TransportEvent::DataSent { connection, error: Some(e) } => {
            warn!("Write to {} failed: {}", connection, e);
        }
        TransportEvent::DataSent { .. } => {}
        TransportEvent::ConnectionLost { connection, error } => {
            let peers = transport.connections().await.len();
            match error {
                Some(e) => warn!("Peer {} lost: {} ({} connected)", connection, e, peers),
                None => info!("Peer {} disconnected ({} connected)", connection, peers),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let endpoint =
        std::env::var("LINKWIRE_ENDPOINT").unwrap_or_else(|_| "0.0.0.0:5020".into());
    let medium: MediumKind = std::env::var("LINKWIRE_MEDIUM")
        .unwrap_or_else(|_| "tcp".into())
        .parse()?;

    let (callbacks, mut events) = ChannelCallbacks::new();
    let mut transport = create_transport(medium, callbacks)?;
    transport.setup(server_config(medium, endpoint)?)?;
    transport.start_server().await?;

    match transport.local_identity() {
        Some(local) => info!("Echo server listening on {} ({})", local, medium),
        None => info!("Echo server started ({})", medium),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => serve(&mut transport, event).await,
                None => {
                    error!("Callback channel closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    transport.disconnect(None).await;
    Ok(())
}
