//! linkwire-poll: send one request over any medium and log the reply
//!
//! Environment:
//! - `LINKWIRE_ENDPOINT`: `host:port` or device path (default `127.0.0.1:5020`)
//! - `LINKWIRE_MEDIUM`: `tcp`, `udp`, `serial` or `tls` (default `tcp`)
//! - `LINKWIRE_TLS_CA`: PEM trust anchors, required for `tls`

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use linkwire::{
    create_transport, ChannelCallbacks, MediumKind, TlsMaterial, TransportConfig, TransportEvent,
};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Modbus/TCP "read holding registers", unit 1, address 0, count 2
const POLL_REQUEST: &[u8] = &[
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
];

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn poll_config(medium: MediumKind, endpoint: String) -> Result<TransportConfig> {
    let config = TransportConfig::client(endpoint).with_name("poll");
    if medium != MediumKind::Tls {
        return Ok(config);
    }
    let path = std::env::var("LINKWIRE_TLS_CA").context("LINKWIRE_TLS_CA is required for tls")?;
    let anchors = std::fs::read(&path).with_context(|| format!("reading {}", path))?;
    Ok(config.with_tls(TlsMaterial::client(anchors)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let endpoint =
        std::env::var("LINKWIRE_ENDPOINT").unwrap_or_else(|_| "127.0.0.1:5020".into());
    let medium: MediumKind = std::env::var("LINKWIRE_MEDIUM")
        .unwrap_or_else(|_| "tcp".into())
        .parse()?;

    info!("Poll starting: {} {}", medium, endpoint);

    let (callbacks, mut events) = ChannelCallbacks::new();
    let mut transport = create_transport(medium, callbacks)?;
    transport.setup(poll_config(medium, endpoint)?)?;

    let connection = transport.connect().await?;
    transport
        .send(&connection, Bytes::from_static(POLL_REQUEST))
        .await?;

    let outcome = tokio::time::timeout(REPLY_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::ConnectionMade(conn) => info!("Connected: {}", conn),
                TransportEvent::DataSent { error: None, .. } => {
                    info!("Request sent ({} bytes)", POLL_REQUEST.len())
                }
                TransportEvent::DataSent { error: Some(e), .. } => {
                    error!("Request failed: {}", e);
                    return false;
                }
                TransportEvent::DataReceived { data, .. } => {
                    info!("Reply ({} bytes): {:02x?}", data.len(), &data[..]);
                    return true;
                }
                TransportEvent::ConnectionLost { error, .. } => {
                    warn!("Connection lost before reply: {:?}", error);
                    return false;
                }
            }
        }
        false
    })
    .await;

    transport.disconnect(None).await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => bail!("no reply from {}", connection.peer()),
        Err(_) => bail!("no reply within {:?}", REPLY_TIMEOUT),
    }
}
