//! linkwire shared transport types
//!
//! This crate provides the types every transport backend agrees on: the
//! error taxonomy, the connection state machine and the configuration
//! object. It has no I/O of its own.

pub mod config;
pub mod error;
pub mod state_machine;

use std::fmt;
use std::net::SocketAddr;

pub use config::{
    FlowControl, MediumKind, Parity, RetryPolicy, Role, SerialParams, StopBits, TlsMaterial,
    TransportConfig,
};
pub use error::{
    BindError, BindErrorKind, ConnectError, ConnectErrorKind, TransportError, TransportFault,
};
pub use state_machine::{
    ConnectionState, ConnectionStateMachine, LifecycleEvent, TransitionResult,
};

/// Default parameters for the system
pub mod defaults {
    /// Label used in log events when none is configured
    pub const COMM_NAME: &str = "comm";

    /// Connect / handshake / flush timeout in milliseconds
    pub const TIMEOUT_MS: u64 = 10_000;

    /// First delay between connect retries
    pub const RECONNECT_DELAY_MS: u64 = 100;

    /// Upper bound for the connect retry delay
    pub const RECONNECT_DELAY_MAX_MS: u64 = 300_000;

    /// Silence after which a datagram server peer is closed
    pub const IDLE_TIMEOUT_MS: u64 = 60_000;

    /// Maximum size of one inbound chunk
    pub const READ_BUFFER_SIZE: usize = 4096;

    /// Serial line speed when none is configured
    pub const BAUD_RATE: u32 = 9600;
}

/// Identity of the far end of a connection (or of a local endpoint)
///
/// Opaque to the protocol layer; used as the registry key and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerIdentity {
    /// Socket address of a network peer
    Socket(SocketAddr),
    /// Serial device path
    Device(String),
    /// Named endpoint of a custom medium
    Named(String),
}

impl PeerIdentity {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerIdentity::Socket(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerIdentity::Socket(addr) => write!(f, "{}", addr),
            PeerIdentity::Device(path) => write!(f, "{}", path),
            PeerIdentity::Named(name) => write!(f, "mem:{}", name),
        }
    }
}

impl From<SocketAddr> for PeerIdentity {
    fn from(addr: SocketAddr) -> Self {
        PeerIdentity::Socket(addr)
    }
}
