//! TLS over TCP using rustls

use crate::transport::stream::StreamTransport;
use crate::transport::tcp::{accept_tcp, bind_tcp, connect_tcp};
use crate::transport::traits::{Handshake, StreamAcceptor, StreamMedium};
use async_trait::async_trait;
use linkwire_shared::{
    BindError, ConnectError, ConnectErrorKind, MediumKind, PeerIdentity, Role, TlsMaterial,
    TransportConfig, TransportError, TransportFault,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor as RustlsAcceptor, TlsConnector, TlsStream};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::config(format!("invalid {} PEM: {}", what, e)))?;
    if certs.is_empty() {
        return Err(TransportError::config(format!("no certificates in {}", what)));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TransportError::config(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| TransportError::config("no private key in PEM"))
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(pem, "trust anchors")? {
        roots
            .add(cert)
            .map_err(|e| TransportError::config(format!("unusable trust anchor: {}", e)))?;
    }
    Ok(roots)
}

fn tls_config_error(e: rustls::Error) -> TransportError {
    TransportError::config(format!("TLS configuration rejected: {}", e))
}

fn client_config(tls: &TlsMaterial) -> Result<ClientConfig, TransportError> {
    let anchors = tls
        .trust_anchors
        .as_deref()
        .ok_or_else(|| TransportError::config("TLS client requires trust anchors"))?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_config_error)?
        .with_root_certificates(root_store(anchors)?);

    match (&tls.certificate_chain, &tls.private_key) {
        (Some(chain), Some(key)) => builder
            .with_client_auth_cert(load_certs(chain, "certificate chain")?, load_key(key)?)
            .map_err(tls_config_error),
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn server_config(tls: &TlsMaterial) -> Result<ServerConfig, TransportError> {
    let (chain, key) = match (&tls.certificate_chain, &tls.private_key) {
        (Some(chain), Some(key)) => (load_certs(chain, "certificate chain")?, load_key(key)?),
        _ => {
            return Err(TransportError::config(
                "TLS server requires a certificate chain and private key",
            ))
        }
    };
    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_config_error)?;

    let builder = match (&tls.trust_anchors, tls.require_client_auth) {
        (Some(anchors), true) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(anchors)?), provider())
                    .build()
                    .map_err(|e| TransportError::config(format!("client verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        }
        _ => builder.with_no_client_auth(),
    };
    builder.with_single_cert(chain, key).map_err(tls_config_error)
}

/// Whether `err` carries a rustls protocol or certificate error
fn is_tls_error(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<rustls::Error>())
        .unwrap_or(false)
}

fn handshake_error(endpoint: &str, err: &io::Error) -> ConnectError {
    if is_tls_error(err)
        || matches!(
            err.kind(),
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
        )
    {
        ConnectError::new(endpoint, ConnectErrorKind::Handshake, err.to_string())
    } else {
        ConnectError::from_io(endpoint, err)
    }
}

/// TLS medium; configured from [`TlsMaterial`] during `setup`
#[derive(Default, Clone)]
pub struct TlsMedium {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<ServerName<'static>>,
}

#[async_trait]
impl StreamMedium for TlsMedium {
    type Stream = TlsStream<TcpStream>;
    type Acceptor = TlsAcceptor;

    fn kind(&self) -> MediumKind {
        MediumKind::Tls
    }

    fn name(&self) -> &'static str {
        "TLS"
    }

    fn prepare(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        config.validate_for(MediumKind::Tls)?;
        let tls = config
            .tls
            .as_ref()
            .ok_or_else(|| TransportError::config("TLS material is required"))?;

        match config.role {
            Role::Client => {
                let name = tls
                    .server_name
                    .clone()
                    .unwrap_or_else(|| config.endpoint_host().to_string());
                let server_name = ServerName::try_from(name.clone())
                    .map_err(|_| TransportError::config(format!("invalid server name '{}'", name)))?;
                self.client = Some(Arc::new(client_config(tls)?));
                self.server_name = Some(server_name);
                self.server = None;
            }
            Role::Server => {
                self.server = Some(Arc::new(server_config(tls)?));
                self.client = None;
                self.server_name = None;
            }
        }
        Ok(())
    }

    async fn open(
        &self,
        config: &TransportConfig,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), ConnectError> {
        let (client, server_name) = match (&self.client, &self.server_name) {
            (Some(client), Some(name)) => (client.clone(), name.clone()),
            _ => {
                return Err(ConnectError::new(
                    &config.endpoint,
                    ConnectErrorKind::Other,
                    "TLS client is not configured",
                ))
            }
        };

        let (tcp, peer) = connect_tcp(config).await?;
        let stream = TlsConnector::from(client)
            .connect(server_name, tcp)
            .await
            .map_err(|e| handshake_error(&config.endpoint, &e))?;
        Ok((TlsStream::from(stream), peer.into()))
    }

    async fn bind(&self, config: &TransportConfig) -> Result<TlsAcceptor, BindError> {
        let server = self.server.clone().ok_or_else(|| {
            BindError::new(
                &config.endpoint,
                linkwire_shared::BindErrorKind::Other,
                "TLS server is not configured",
            )
        })?;
        let (listener, local) = bind_tcp(config).await?;
        Ok(TlsAcceptor {
            listener,
            local,
            acceptor: RustlsAcceptor::from(server),
        })
    }

    fn classify_fault(err: io::Error) -> TransportFault {
        if is_tls_error(&err) {
            TransportFault::Tls(err.to_string())
        } else {
            TransportFault::from(err)
        }
    }
}

/// Bound TLS listener; each peer's handshake runs off the accept path
pub struct TlsAcceptor {
    listener: TcpListener,
    local: SocketAddr,
    acceptor: RustlsAcceptor,
}

#[async_trait]
impl StreamAcceptor for TlsAcceptor {
    type Stream = TlsStream<TcpStream>;

    fn local_identity(&self) -> PeerIdentity {
        self.local.into()
    }

    async fn accept(&mut self) -> io::Result<(PeerIdentity, Handshake<Self::Stream>)> {
        let (tcp, addr) = accept_tcp(&self.listener).await?;
        let acceptor = self.acceptor.clone();
        let handshake: Handshake<Self::Stream> =
            Box::pin(async move { acceptor.accept(tcp).await.map(TlsStream::from) });
        Ok((addr.into(), handshake))
    }
}

/// Transport over TLS
pub type TlsTransport = StreamTransport<TlsMedium>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::recorder;
    use crate::transport::Transport;
    use bytes::Bytes;
    use linkwire_shared::ConnectionState;

    const CA: &[u8] = include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/ca.pem"));
    const OTHER_CA: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/other-ca.pem"));
    const SERVER_CERT: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/server.pem"));
    const SERVER_KEY: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/server-key.pem"));
    const CLIENT_CERT: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/client.pem"));
    const CLIENT_KEY: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/tls/client-key.pem"));

    async fn tls_server(
        callbacks: Arc<crate::ChannelCallbacks>,
    ) -> (TlsTransport, SocketAddr) {
        let mut server = TlsTransport::new(callbacks);
        server
            .setup(
                TransportConfig::server("127.0.0.1:0")
                    .with_tls(TlsMaterial::server(SERVER_CERT, SERVER_KEY)),
            )
            .unwrap();
        server.start_server().await.unwrap();
        let addr = server.local_identity().unwrap().socket_addr().unwrap();
        (server, addr)
    }

    fn client_config_for(addr: SocketAddr, anchors: &[u8]) -> TransportConfig {
        TransportConfig::client(addr.to_string())
            .with_tls(TlsMaterial::client(anchors).with_server_name("localhost"))
    }

    #[test]
    fn test_setup_requires_material() {
        let (callbacks, _log) = recorder();
        let mut transport = TlsTransport::new(callbacks);

        let err = transport
            .setup(TransportConfig::client("127.0.0.1:4433"))
            .unwrap_err();
        assert!(err.is_configuration());

        let err = transport
            .setup(TransportConfig::client("127.0.0.1:4433").with_tls(TlsMaterial::client(&b"junk"[..])))
            .unwrap_err();
        assert!(err.is_configuration());

        let err = transport
            .setup(
                TransportConfig::server("127.0.0.1:4433")
                    .with_tls(TlsMaterial::server(SERVER_CERT, &b"not a key"[..])),
            )
            .unwrap_err();
        assert!(err.is_configuration());

        assert!(transport
            .setup(TransportConfig::client("127.0.0.1:4433").with_tls(TlsMaterial::client(CA)))
            .is_ok());
    }

    #[tokio::test]
    async fn test_tls_round_trip() {
        let (server_callbacks, mut server_log) = recorder();
        let (mut server, addr) = tls_server(server_callbacks).await;

        let (client_callbacks, mut client_log) = recorder();
        let mut client = TlsTransport::new(client_callbacks);
        client.setup(client_config_for(addr, CA)).unwrap();

        let connection = client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Open);
        client_log.expect_made().await;
        let peer = server_log.expect_made().await;

        client
            .send(&connection, Bytes::from_static(b"\x01\x03\x00\x00\x00\x02"))
            .await
            .unwrap();
        client_log.expect_sent().await;
        assert_eq!(
            &server_log.collect_received(6).await[..],
            b"\x01\x03\x00\x00\x00\x02"
        );

        server
            .send(&peer, Bytes::from_static(b"\x01\x03\x04\x00\x0a\x00\x0b"))
            .await
            .unwrap();
        server_log.expect_sent().await;
        assert_eq!(
            &client_log.collect_received(7).await[..],
            b"\x01\x03\x04\x00\x0a\x00\x0b"
        );

        client.disconnect(None).await;
        let (_, error) = client_log.expect_lost().await;
        assert!(error.is_none());

        let (lost, error) = server_log.expect_lost().await;
        assert_eq!(lost, peer);
        assert!(error.is_none());
        server.disconnect(None).await;
    }

    async fn mutual_tls_server(
        callbacks: Arc<crate::ChannelCallbacks>,
    ) -> (TlsTransport, SocketAddr) {
        let mut server = TlsTransport::new(callbacks);
        server
            .setup(TransportConfig::server("127.0.0.1:0").with_tls(
                TlsMaterial::server(SERVER_CERT, SERVER_KEY).with_client_auth(CA),
            ))
            .unwrap();
        server.start_server().await.unwrap();
        let addr = server.local_identity().unwrap().socket_addr().unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_mutual_tls_round_trip() {
        let (server_callbacks, mut server_log) = recorder();
        let (mut server, addr) = mutual_tls_server(server_callbacks).await;

        let (client_callbacks, mut client_log) = recorder();
        let mut client = TlsTransport::new(client_callbacks);
        client
            .setup(TransportConfig::client(addr.to_string()).with_tls(
                TlsMaterial::client(CA)
                    .with_server_name("localhost")
                    .with_identity(CLIENT_CERT, CLIENT_KEY),
            ))
            .unwrap();

        let connection = client.connect().await.unwrap();
        client_log.expect_made().await;
        let peer = server_log.expect_made().await;

        client
            .send(&connection, Bytes::from_static(b"authenticated"))
            .await
            .unwrap();
        client_log.expect_sent().await;
        assert_eq!(&server_log.collect_received(13).await[..], b"authenticated");

        server.send(&peer, Bytes::from_static(b"welcome")).await.unwrap();
        server_log.expect_sent().await;
        assert_eq!(&client_log.collect_received(7).await[..], b"welcome");

        client.disconnect(None).await;
        let (_, error) = client_log.expect_lost().await;
        assert!(error.is_none());
        let (lost, _) = server_log.expect_lost().await;
        assert_eq!(lost, peer);
        server.disconnect(None).await;
    }

    #[tokio::test]
    async fn test_mutual_tls_rejects_anonymous_client() {
        let (server_callbacks, mut server_log) = recorder();
        let (server, addr) = mutual_tls_server(server_callbacks).await;

        let (client_callbacks, mut client_log) = recorder();
        let mut client = TlsTransport::new(client_callbacks);
        client.setup(client_config_for(addr, CA)).unwrap();

        // TLS 1.3 clients finish before the server checks their certificate,
        // so the rejection shows up as a lost connection or a failed connect
        match client.connect().await {
            Ok(_) => {
                client_log.expect_made().await;
                let (_, error) = client_log.expect_lost().await;
                assert!(error.is_some());
            }
            Err(e) => assert_eq!(e.connect_kind(), Some(ConnectErrorKind::Handshake)),
        }

        server_log.assert_quiet().await;
        assert!(server.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_untrusted_server_fails_handshake() {
        let (server_callbacks, mut server_log) = recorder();
        let (server, addr) = tls_server(server_callbacks).await;

        let (client_callbacks, mut client_log) = recorder();
        let mut client = TlsTransport::new(client_callbacks);
        client.setup(client_config_for(addr, OTHER_CA)).unwrap();

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Handshake));
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(client.connections().await.is_empty());
        client_log.assert_quiet().await;

        // The server drops the failed peer silently
        server_log.assert_quiet().await;
        assert!(server.connections().await.is_empty());
        assert_eq!(server.state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_wrong_server_name_fails_handshake() {
        let (_server, addr) = tls_server(recorder().0).await;

        let (callbacks, mut log) = recorder();
        let mut client = TlsTransport::new(callbacks);
        client
            .setup(
                TransportConfig::client(addr.to_string())
                    .with_tls(TlsMaterial::client(CA).with_server_name("plc.example.net")),
            )
            .unwrap();

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.connect_kind(), Some(ConnectErrorKind::Handshake));
        log.assert_quiet().await;
    }

    #[test]
    fn test_rustls_errors_classify_as_tls() {
        let err = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        assert!(matches!(TlsMedium::classify_fault(err), TransportFault::Tls(_)));

        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(TlsMedium::classify_fault(err), TransportFault::Reset);
    }
}
