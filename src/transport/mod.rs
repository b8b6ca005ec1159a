//! Transport backends
//!
//! Every backend implements [`Transport`]. Stream media share one generic
//! implementation ([`StreamTransport`]); UDP has its own because datagrams
//! need demultiplexing rather than accepting.

pub(crate) mod backend;
pub mod null_modem;
pub mod serial;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod traits;
pub mod udp;

pub use null_modem::{CustomTransport, NullModem, NullModemAcceptor};
pub use serial::{SerialAcceptor, SerialMedium, SerialTransport};
pub use stream::StreamTransport;
pub use tcp::{TcpAcceptor, TcpMedium, TcpTransport};
pub use tls::{TlsAcceptor, TlsMedium, TlsTransport};
pub use traits::{Handshake, LinkReader, LinkWriter, StreamAcceptor, StreamMedium, Transport};
pub use udp::UdpTransport;

use crate::callbacks::TransportCallbacks;
use linkwire_shared::{MediumKind, TransportError};
use std::sync::Arc;

/// Build a backend for `kind`
///
/// Custom media have no built-in backend; construct a
/// [`CustomTransport`] with the medium instead.
pub fn create_transport(
    kind: MediumKind,
    callbacks: Arc<dyn TransportCallbacks>,
) -> Result<Box<dyn Transport>, TransportError> {
    let transport: Box<dyn Transport> = match kind {
        MediumKind::Tcp => Box::new(TcpTransport::new(callbacks)),
        MediumKind::Tls => Box::new(TlsTransport::new(callbacks)),
        MediumKind::Udp => Box::new(UdpTransport::new(callbacks)),
        MediumKind::Serial => Box::new(SerialTransport::new(callbacks)),
        MediumKind::Custom => {
            return Err(TransportError::config(
                "custom media are built with CustomTransport::with_medium",
            ))
        }
    };
    Ok(transport)
}
