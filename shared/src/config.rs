//! Transport configuration consumed by `Transport::setup`
//!
//! Plain structs with defaults and small builder helpers. Parsing these
//! from files or command lines is left to the application.

use crate::defaults;
use crate::error::TransportError;
use std::fmt;
use std::time::Duration;

/// Which side of the conversation a backend plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Built-in media, used for validation and backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediumKind {
    Tcp,
    Tls,
    Udp,
    Serial,
    Custom,
}

impl fmt::Display for MediumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediumKind::Tcp => write!(f, "TCP"),
            MediumKind::Tls => write!(f, "TLS"),
            MediumKind::Udp => write!(f, "UDP"),
            MediumKind::Serial => write!(f, "Serial"),
            MediumKind::Custom => write!(f, "Custom"),
        }
    }
}

impl std::str::FromStr for MediumKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(MediumKind::Tcp),
            "tls" => Ok(MediumKind::Tls),
            "udp" => Ok(MediumKind::Udp),
            "serial" => Ok(MediumKind::Serial),
            other => Err(TransportError::config(format!("unknown medium '{}'", other))),
        }
    }
}

/// Retry policy for client connect attempts
///
/// Delays double after every failed attempt, starting at `initial_delay`
/// and capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(defaults::RECONNECT_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RECONNECT_DELAY_MAX_MS),
        }
    }

    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::none()
        }
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_before(&self, retry: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..retry {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        std::cmp::min(delay, self.max_delay)
    }
}

/// PEM-encoded TLS material
///
/// Server role needs `certificate_chain` and `private_key`. Client role
/// needs `trust_anchors`; a client identity (chain + key) is optional and
/// used for mutual TLS.
#[derive(Clone, Default)]
pub struct TlsMaterial {
    pub certificate_chain: Option<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub trust_anchors: Option<Vec<u8>>,
    /// Name to verify the server certificate against; defaults to the
    /// endpoint host
    pub server_name: Option<String>,
    /// Server only: demand a client certificate signed by `trust_anchors`
    pub require_client_auth: bool,
}

impl TlsMaterial {
    /// Material for a server presenting `chain` / `key`
    pub fn server(chain: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            certificate_chain: Some(chain.into()),
            private_key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Material for a client trusting `anchors`
    pub fn client(anchors: impl Into<Vec<u8>>) -> Self {
        Self {
            trust_anchors: Some(anchors.into()),
            ..Default::default()
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Client identity presented for mutual TLS
    pub fn with_identity(mut self, chain: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        self.certificate_chain = Some(chain.into());
        self.private_key = Some(key.into());
        self
    }

    /// Require clients to present a certificate signed by `anchors`
    pub fn with_client_auth(mut self, anchors: impl Into<Vec<u8>>) -> Self {
        self.trust_anchors = Some(anchors.into());
        self.require_client_auth = true;
        self
    }

    fn validate(&self, role: Role) -> Result<(), TransportError> {
        let has_chain = self.certificate_chain.is_some();
        let has_key = self.private_key.is_some();
        if has_chain != has_key {
            return Err(TransportError::config(
                "TLS certificate chain and private key must be given together",
            ));
        }

        match role {
            Role::Server => {
                if !has_chain {
                    return Err(TransportError::config(
                        "TLS server requires a certificate chain and private key",
                    ));
                }
                if self.require_client_auth && self.trust_anchors.is_none() {
                    return Err(TransportError::config(
                        "TLS client authentication requires trust anchors",
                    ));
                }
            }
            Role::Client => {
                if self.trust_anchors.is_none() {
                    return Err(TransportError::config("TLS client requires trust anchors"));
                }
                if self.require_client_auth {
                    return Err(TransportError::config(
                        "require_client_auth only applies to servers",
                    ));
                }
            }
        }
        Ok(())
    }
}

// Key material stays out of logs
impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate_chain", &self.certificate_chain.is_some())
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("trust_anchors", &self.trust_anchors.is_some())
            .field("server_name", &self.server_name)
            .field("require_client_auth", &self.require_client_auth)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
    /// 5, 6, 7 or 8
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: defaults::BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialParams {
    fn validate(&self) -> Result<(), TransportError> {
        if self.baud_rate == 0 {
            return Err(TransportError::config("baud rate must be positive"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(TransportError::config(format!(
                "unsupported data bits: {}",
                self.data_bits
            )));
        }
        Ok(())
    }
}

/// Configuration for a transport backend
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Label used in log events
    pub name: String,
    pub role: Role,
    /// `host:port`, device path, or in-memory endpoint name
    pub endpoint: String,
    /// Connect/handshake timeout; also bounds each write and the flush on close
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub tls: Option<TlsMaterial>,
    pub serial: Option<SerialParams>,
    /// Maximum bytes delivered per `data_received` chunk
    pub read_buffer_size: usize,
    /// Datagram server peers with no traffic for this long are closed
    pub idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: defaults::COMM_NAME.into(),
            role: Role::Client,
            endpoint: String::new(),
            timeout: Duration::from_millis(defaults::TIMEOUT_MS),
            retry: RetryPolicy::none(),
            tls: None,
            serial: None,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
        }
    }
}

impl TransportConfig {
    /// Client configuration targeting `endpoint`
    pub fn client(endpoint: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Server configuration bound to `endpoint`
    pub fn server(endpoint: impl Into<String>) -> Self {
        Self {
            role: Role::Server,
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_serial(mut self, serial: SerialParams) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Serial parameters, falling back to defaults
    pub fn serial_params(&self) -> SerialParams {
        self.serial.clone().unwrap_or_default()
    }

    /// Host part of a `host:port` endpoint (brackets stripped for IPv6)
    pub fn endpoint_host(&self) -> &str {
        let endpoint = self.endpoint.as_str();
        if let Some(rest) = endpoint.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match endpoint.rsplit_once(':') {
            Some((host, _)) => host,
            None => endpoint,
        }
    }

    /// Validate options that apply to every medium, then those specific to `medium`
    pub fn validate_for(&self, medium: MediumKind) -> Result<(), TransportError> {
        if self.endpoint.trim().is_empty() {
            return Err(TransportError::config("endpoint is required"));
        }
        if self.timeout.is_zero() {
            return Err(TransportError::config("timeout must be positive"));
        }
        if self.idle_timeout.is_zero() {
            return Err(TransportError::config("idle timeout must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(TransportError::config("read buffer size must be positive"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(TransportError::config(
                "retry initial delay exceeds maximum delay",
            ));
        }

        match medium {
            MediumKind::Tcp | MediumKind::Udp | MediumKind::Tls => {
                if self.serial.is_some() {
                    return Err(TransportError::config(format!(
                        "serial parameters do not apply to {}",
                        medium
                    )));
                }
                validate_socket_endpoint(&self.endpoint)?;
            }
            MediumKind::Serial => {
                if self.tls.is_some() {
                    return Err(TransportError::config("TLS material does not apply to Serial"));
                }
                self.serial_params().validate()?;
            }
            MediumKind::Custom => {
                if self.serial.is_some() {
                    return Err(TransportError::config(
                        "serial parameters do not apply to Custom",
                    ));
                }
            }
        }

        match (medium, &self.tls) {
            (MediumKind::Tls, Some(tls)) => tls.validate(self.role)?,
            (MediumKind::Tls, None) => {
                return Err(TransportError::config("TLS material is required"));
            }
            (MediumKind::Tcp | MediumKind::Udp | MediumKind::Custom, Some(_)) => {
                return Err(TransportError::config(format!(
                    "TLS material does not apply to {}",
                    medium
                )));
            }
            _ => {}
        }

        Ok(())
    }
}

fn validate_socket_endpoint(endpoint: &str) -> Result<(), TransportError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| TransportError::config(format!("endpoint '{}' lacks a port", endpoint)))?;
    if host.is_empty() {
        return Err(TransportError::config(format!("endpoint '{}' lacks a host", endpoint)));
    }
    port.parse::<u16>()
        .map_err(|_| TransportError::config(format!("invalid port in endpoint '{}'", endpoint)))?;
    Ok(())
}
