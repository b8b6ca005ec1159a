//! linkwire: one connection contract over TCP, TLS, UDP, serial lines and
//! custom media
//!
//! A protocol layer owns a [`Transport`] and receives lifecycle and data
//! events through [`TransportCallbacks`]. It never needs to know which
//! medium is underneath.

pub mod callbacks;
pub mod connection;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use callbacks::{ChannelCallbacks, TransportCallbacks, TransportEvent};
pub use connection::{Connection, ConnectionRegistry, ConnectionRole, Listener};
pub use transport::{
    create_transport, CustomTransport, NullModem, SerialTransport, StreamMedium, StreamTransport,
    TcpTransport, TlsTransport, Transport, UdpTransport,
};

pub use linkwire_shared::{
    defaults, BindError, BindErrorKind, ConnectError, ConnectErrorKind, ConnectionState,
    FlowControl, MediumKind, Parity, PeerIdentity, RetryPolicy, Role, SerialParams, StopBits,
    TlsMaterial, TransportConfig, TransportError, TransportFault,
};
