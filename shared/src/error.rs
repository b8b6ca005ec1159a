//! Error taxonomy shared by every transport backend
//!
//! Synchronous failures are returned as [`TransportError`]. Faults that
//! happen asynchronously on an open connection are never returned from a
//! call; they travel inside the `data_sent` / `connection_lost` callbacks
//! as a [`TransportFault`].

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors returned synchronously from transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Connection is not open")]
    NotConnected,
}

impl TransportError {
    /// Shorthand for a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Whether this is a configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Connect failure kind, if this is a connect error
    pub fn connect_kind(&self) -> Option<ConnectErrorKind> {
        match self {
            Self::Connect(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Bind failure kind, if this is a bind error
    pub fn bind_kind(&self) -> Option<BindErrorKind> {
        match self {
            Self::Bind(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Why a listener could not claim its endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindErrorKind {
    AddressInUse,
    PermissionDenied,
    DeviceUnavailable,
    Other,
}

impl BindErrorKind {
    /// Classify an I/O error raised while binding
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => Self::DeviceUnavailable,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for BindErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindErrorKind::AddressInUse => write!(f, "address in use"),
            BindErrorKind::PermissionDenied => write!(f, "permission denied"),
            BindErrorKind::DeviceUnavailable => write!(f, "device unavailable"),
            BindErrorKind::Other => write!(f, "other"),
        }
    }
}

/// A listener failed to bind
#[derive(Error, Debug, Clone)]
#[error("Bind to {endpoint} failed ({kind}): {reason}")]
pub struct BindError {
    pub endpoint: String,
    pub kind: BindErrorKind,
    pub reason: String,
}

impl BindError {
    pub fn new(endpoint: impl Into<String>, kind: BindErrorKind, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn from_io(endpoint: impl Into<String>, err: &io::Error) -> Self {
        Self::new(endpoint, BindErrorKind::from_io(err), err.to_string())
    }
}

/// Why a client connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Refused,
    Timeout,
    Unreachable,
    /// Cryptographic handshake rejected (bad certificate, wrong name, ...)
    Handshake,
    /// `connect` called while a connection is already open
    InvalidState,
    Other,
}

impl ConnectErrorKind {
    /// Classify an I/O error raised while connecting
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::PermissionDenied => Self::Unreachable,
            _ => Self::Other,
        }
    }

    /// Whether a retry policy may try again after this failure
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Handshake | Self::InvalidState)
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectErrorKind::Refused => write!(f, "refused"),
            ConnectErrorKind::Timeout => write!(f, "timeout"),
            ConnectErrorKind::Unreachable => write!(f, "unreachable"),
            ConnectErrorKind::Handshake => write!(f, "handshake failed"),
            ConnectErrorKind::InvalidState => write!(f, "invalid state"),
            ConnectErrorKind::Other => write!(f, "other"),
        }
    }
}

/// A client connection attempt failed
#[derive(Error, Debug, Clone)]
#[error("Connect to {endpoint} failed ({kind}): {reason}")]
pub struct ConnectError {
    pub endpoint: String,
    pub kind: ConnectErrorKind,
    pub reason: String,
}

impl ConnectError {
    pub fn new(endpoint: impl Into<String>, kind: ConnectErrorKind, reason: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            reason: reason.into(),
        }
    }

    pub fn from_io(endpoint: impl Into<String>, err: &io::Error) -> Self {
        Self::new(endpoint, ConnectErrorKind::from_io(err), err.to_string())
    }

    pub fn timeout(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, ConnectErrorKind::Timeout, "connect timed out")
    }
}

/// Medium fault on an open connection, delivered through callbacks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    #[error("Connection reset by peer")]
    Reset,

    #[error("Operation timed out")]
    Timeout,

    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("TLS failure: {0}")]
    Tls(String),
}

impl From<io::Error> for TransportFault {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportFault::Reset,
            io::ErrorKind::TimedOut => TransportFault::Timeout,
            kind => TransportFault::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}
