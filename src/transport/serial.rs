//! Serial line transport using tokio-serial
//!
//! A serial line has no listen concept: in server role the device is
//! opened by `start_server` and presented as the single accepted peer.

use crate::transport::stream::StreamTransport;
use crate::transport::traits::{Handshake, StreamAcceptor, StreamMedium};
use async_trait::async_trait;
use futures::future;
use linkwire_shared::{
    BindError, BindErrorKind, ConnectError, ConnectErrorKind, FlowControl, MediumKind, Parity,
    PeerIdentity, SerialParams, StopBits, TransportConfig,
};
use std::io;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

fn data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    }
}

fn stop_bits(stop_bits: StopBits) -> tokio_serial::StopBits {
    match stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

fn flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
    match flow {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    }
}

fn open_device(config: &TransportConfig) -> tokio_serial::Result<SerialStream> {
    let params: SerialParams = config.serial_params();
    debug!(
        "[{}] opening {} at {} baud",
        config.name, config.endpoint, params.baud_rate
    );
    tokio_serial::new(config.endpoint.as_str(), params.baud_rate)
        .data_bits(data_bits(params.data_bits))
        .parity(parity(params.parity))
        .stop_bits(stop_bits(params.stop_bits))
        .flow_control(flow_control(params.flow_control))
        .timeout(config.timeout)
        .open_native_async()
}

fn connect_error(endpoint: &str, err: &tokio_serial::Error) -> ConnectError {
    let kind = match err.kind() {
        tokio_serial::ErrorKind::NoDevice => ConnectErrorKind::Unreachable,
        tokio_serial::ErrorKind::Io(kind) => ConnectErrorKind::from_io(&io::Error::from(kind)),
        _ => ConnectErrorKind::Other,
    };
    ConnectError::new(endpoint, kind, err.to_string())
}

fn bind_error(endpoint: &str, err: &tokio_serial::Error) -> BindError {
    let kind = match err.kind() {
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            BindErrorKind::PermissionDenied
        }
        _ => BindErrorKind::DeviceUnavailable,
    };
    BindError::new(endpoint, kind, err.to_string())
}

/// Serial line medium; the endpoint is the device path
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialMedium;

#[async_trait]
impl StreamMedium for SerialMedium {
    type Stream = SerialStream;
    type Acceptor = SerialAcceptor;

    fn kind(&self) -> MediumKind {
        MediumKind::Serial
    }

    fn name(&self) -> &'static str {
        "Serial"
    }

    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(SerialStream, PeerIdentity), ConnectError> {
        let stream = open_device(config).map_err(|e| connect_error(&config.endpoint, &e))?;
        Ok((stream, PeerIdentity::Device(config.endpoint.clone())))
    }

    async fn bind(&self, config: &TransportConfig) -> Result<SerialAcceptor, BindError> {
        let stream = open_device(config).map_err(|e| bind_error(&config.endpoint, &e))?;
        Ok(SerialAcceptor {
            device: PeerIdentity::Device(config.endpoint.clone()),
            line: Some(stream),
        })
    }
}

/// Yields the opened line once, then waits forever
pub struct SerialAcceptor {
    device: PeerIdentity,
    line: Option<SerialStream>,
}

#[async_trait]
impl StreamAcceptor for SerialAcceptor {
    type Stream = SerialStream;

    fn local_identity(&self) -> PeerIdentity {
        self.device.clone()
    }

    async fn accept(&mut self) -> io::Result<(PeerIdentity, Handshake<SerialStream>)> {
        match self.line.take() {
            Some(line) => {
                let ready: Handshake<SerialStream> = Box::pin(future::ready(Ok(line)));
                Ok((self.device.clone(), ready))
            }
            None => future::pending().await,
        }
    }
}

/// Transport over a serial line
pub type SerialTransport = StreamTransport<SerialMedium>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::recorder;
    use crate::transport::Transport;
    use linkwire_shared::ConnectionState;

    const MISSING_DEVICE: &str = "/dev/linkwire-no-such-tty";

    #[test]
    fn test_line_parameter_mapping() {
        assert_eq!(data_bits(7), tokio_serial::DataBits::Seven);
        assert_eq!(data_bits(8), tokio_serial::DataBits::Eight);
        assert_eq!(parity(Parity::Even), tokio_serial::Parity::Even);
        assert_eq!(stop_bits(StopBits::Two), tokio_serial::StopBits::Two);
        assert_eq!(
            flow_control(FlowControl::Hardware),
            tokio_serial::FlowControl::Hardware
        );
    }

    #[test]
    fn test_setup_validates_line_parameters() {
        let (callbacks, _log) = recorder();
        let mut transport = SerialTransport::new(callbacks);

        let bad = SerialParams {
            data_bits: 9,
            ..Default::default()
        };
        let err = transport
            .setup(TransportConfig::client("/dev/ttyUSB0").with_serial(bad))
            .unwrap_err();
        assert!(err.is_configuration());

        let even = SerialParams {
            baud_rate: 19_200,
            parity: Parity::Even,
            ..Default::default()
        };
        assert!(transport
            .setup(TransportConfig::client("/dev/ttyUSB0").with_serial(even))
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_device_connect_fails_cleanly() {
        let (callbacks, mut log) = recorder();
        let mut transport = SerialTransport::new(callbacks);
        transport
            .setup(TransportConfig::client(MISSING_DEVICE))
            .unwrap();

        let err = transport.connect().await.unwrap_err();
        assert!(err.connect_kind().is_some());
        assert_eq!(transport.state(), ConnectionState::Idle);
        log.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_missing_device_server_is_unavailable() {
        let (callbacks, mut log) = recorder();
        let mut transport = SerialTransport::new(callbacks);
        transport
            .setup(TransportConfig::server(MISSING_DEVICE))
            .unwrap();

        let err = transport.start_server().await.unwrap_err();
        assert_eq!(err.bind_kind(), Some(BindErrorKind::DeviceUnavailable));
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(transport.local_identity().is_none());
        log.assert_quiet().await;
    }

    /// Pseudo-terminal pair: the controlling side plus the device path of
    /// the other side, free to be opened by the transport
    #[cfg(unix)]
    fn pty() -> (SerialStream, String) {
        use tokio_serial::SerialPort;

        let (first, second) = SerialStream::pair().unwrap();
        match (first.name(), second.name()) {
            (None, Some(path)) => (first, path),
            (Some(path), None) => (second, path),
            names => panic!("pty pair without a single named side: {:?}", names),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_client_round_trip_over_pty() {
        use bytes::Bytes;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut line, path) = pty();
        let (callbacks, mut log) = recorder();
        let mut client = SerialTransport::new(callbacks);
        client
            .setup(TransportConfig::client(path.as_str()).with_serial(SerialParams {
                baud_rate: 19_200,
                ..Default::default()
            }))
            .unwrap();

        let connection = client.connect().await.unwrap();
        assert_eq!(connection.peer(), &PeerIdentity::Device(path.clone()));
        assert_eq!(client.state(), ConnectionState::Open);
        log.expect_made().await;

        // Modbus RTU read holding registers, unit 1
        let request = b"\x01\x03\x00\x00\x00\x02\xc4\x0b";
        client
            .send(&connection, Bytes::from_static(request))
            .await
            .unwrap();
        let (_, error) = log.expect_sent().await;
        assert!(error.is_none());
        let mut buf = [0u8; 8];
        line.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, request);

        line.write_all(b"\x01\x03\x04\x00\x0a\x00\x0b").await.unwrap();
        assert_eq!(
            &log.collect_received(7).await[..],
            b"\x01\x03\x04\x00\x0a\x00\x0b"
        );

        client.disconnect(None).await;
        let (_, error) = log.expect_lost().await;
        assert!(error.is_none());
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_presents_line_as_single_peer() {
        use bytes::Bytes;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut line, path) = pty();
        let (callbacks, mut log) = recorder();
        let mut server = SerialTransport::new(callbacks);
        server.setup(TransportConfig::server(path.as_str())).unwrap();
        server.start_server().await.unwrap();
        assert_eq!(
            server.local_identity(),
            Some(PeerIdentity::Device(path.clone()))
        );

        let peer = log.expect_made().await;
        assert_eq!(peer.peer(), &PeerIdentity::Device(path.clone()));
        assert_eq!(server.connections().await, vec![peer.clone()]);

        line.write_all(b"ping").await.unwrap();
        assert_eq!(&log.collect_received(4).await[..], b"ping");

        server.send(&peer, Bytes::from_static(b"pong")).await.unwrap();
        log.expect_sent().await;
        let mut buf = [0u8; 4];
        line.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.disconnect(None).await;
        let (lost, error) = log.expect_lost().await;
        assert_eq!(lost, peer);
        assert!(error.is_none());
        assert_eq!(server.state(), ConnectionState::Idle);
    }
}
