//! TCP and TLS transport for tcpmux connections.
//!
//! This module provides plain TCP dialing/listening with local bind and
//! socket options, plus in-place TLS promotion of an established stream.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream (accepted side)
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS client stream
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// The TCP stream underneath any TLS layer
    pub fn tcp(&self) -> &TcpStream {
        match self {
            IoStream::Plain(stream) => stream,
            IoStream::Tls(stream) => stream.get_ref().0,
            IoStream::TlsClient(stream) => stream.get_ref().0,
        }
    }

    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    /// Whether a TLS layer is active
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }

    /// Leaf certificate the peer presented during the handshake
    pub fn peer_certificate(&self) -> Option<tls::Certificate> {
        let chain = match self {
            IoStream::Plain(_) => None,
            IoStream::Tls(stream) => stream.get_ref().1.peer_certificates(),
            IoStream::TlsClient(stream) => stream.get_ref().1.peer_certificates(),
        }?;
        chain
            .first()
            .map(|leaf| tls::Certificate::from_der(leaf.as_ref().to_vec()))
    }
}

fn new_socket(addr: &SocketAddr) -> std::io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(
    addr: SocketAddr,
    reuse_address: bool,
    backlog: u32,
) -> tokio::io::Result<TcpListener> {
    let socket = new_socket(&addr)?;
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address, optionally from a fixed local address
pub async fn connect_tcp(
    addr: SocketAddr,
    local: Option<SocketAddr>,
    reuse_address: bool,
) -> tokio::io::Result<TcpStream> {
    let socket = new_socket(&addr)?;
    socket.set_reuseaddr(reuse_address)?;
    if let Some(local) = local {
        socket.bind(local)?;
    }
    socket.connect(addr).await
}

/// Resolve `host:port`, returning the first address
pub async fn resolve(host: &str, port: u16) -> tokio::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            )
        })
}

/// Owned handle on the socket under `stream`
///
/// Socket options stay reachable through it after the stream has been split
/// into read and write halves.
pub fn socket_handle(stream: &TcpStream) -> std::io::Result<socket2::Socket> {
    socket2::SockRef::from(stream).try_clone()
}

/// Toggle SO_KEEPALIVE, with the idle time before the first keep-alive packet
pub fn set_keepalive(
    sock: &socket2::Socket,
    enable: bool,
    initial_delay: Option<Duration>,
) -> std::io::Result<()> {
    match (enable, initial_delay) {
        (true, Some(delay)) if !delay.is_zero() => {
            sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(delay))
        }
        _ => sock.set_keepalive(enable),
    }
}

/// TLS transport layer implementation
pub mod tls {
    use super::*;
    use crate::error::SocketError;
    use crate::options::{TlsOptions, TlsServerOptions};
    use anyhow::{Context as AnyhowContext, Result};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};
    use tracing::debug;

    /// An X.509 certificate exchanged during a handshake
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Certificate(Bytes);

    impl Certificate {
        /// Wrap DER-encoded certificate bytes
        pub fn from_der(der: impl Into<Bytes>) -> Self {
            Self(der.into())
        }

        /// DER encoding
        pub fn der(&self) -> &[u8] {
            &self.0
        }

        /// PEM encoding, 64 columns per line
        pub fn to_pem(&self) -> String {
            let encoded = STANDARD.encode(&self.0);
            let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
            pem.push_str("-----BEGIN CERTIFICATE-----\n");
            for (i, c) in encoded.chars().enumerate() {
                if i > 0 && i % 64 == 0 {
                    pem.push('\n');
                }
                pem.push(c);
            }
            pem.push_str("\n-----END CERTIFICATE-----\n");
            pem
        }
    }

    /// Everything needed to run a client handshake
    #[derive(Clone)]
    pub struct ClientTls {
        /// Rustls client configuration
        pub config: Arc<ClientConfig>,
        /// Server name for SNI
        pub server_name: ServerName<'static>,
        /// Client certificate presented when the server asks for one
        pub certificate: Option<Certificate>,
    }

    impl std::fmt::Debug for ClientTls {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ClientTls")
                .field("server_name", &self.server_name)
                .field("client_auth", &self.certificate.is_some())
                .finish()
        }
    }

    /// Everything needed to run a server handshake
    #[derive(Clone)]
    pub struct ServerTls {
        /// Acceptor built from the server configuration
        pub acceptor: TlsAcceptor,
        /// Certificate the server presents
        pub certificate: Option<Certificate>,
    }

    impl std::fmt::Debug for ServerTls {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ServerTls")
                .field("certificate", &self.certificate.is_some())
                .finish()
        }
    }

    fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(pem).context("Failed to parse CA certificates")? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    fn leaf_certificate(pem: &str) -> Result<Option<Certificate>> {
        Ok(load_certs(pem)?
            .first()
            .map(|leaf| Certificate::from_der(leaf.as_ref().to_vec())))
    }

    fn bad_config(e: anyhow::Error) -> SocketError {
        SocketError::BadConfig(format!("{:#}", e))
    }

    /// Build the client side of a handshake towards `host`
    pub fn client_tls(options: &TlsOptions, host: &str) -> Result<ClientTls, SocketError> {
        let config = make_client_config(options).map_err(bad_config)?;
        let name = options.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|_| SocketError::BadConfig(format!("Invalid server name: {}", name)))?;
        let certificate = match options.identity()? {
            Some((cert, _)) => leaf_certificate(cert).map_err(bad_config)?,
            None => None,
        };
        Ok(ClientTls {
            config: Arc::new(config),
            server_name,
            certificate,
        })
    }

    /// Create a TLS client configuration
    pub fn make_client_config(options: &TlsOptions) -> Result<ClientConfig> {
        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = ClientConfig::builder();
        let builder = if options.check_validity {
            let ca = options
                .ca
                .as_deref()
                .context("A CA certificate is required when checkValidity is enabled")?;
            builder.with_root_certificates(load_roots(ca)?)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        };

        let identity = options.identity().map_err(anyhow::Error::new)?;
        let config = match identity {
            Some((cert, key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .context("Failed to configure client certificate")?,
            None => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    /// Create a TLS server configuration, with mTLS when a CA is given
    pub fn make_server_config(options: &TlsServerOptions) -> Result<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = ServerConfig::builder();
        let builder = match options.ca.as_deref() {
            Some(ca) => {
                let client_verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
                        .build()
                        .context("Failed to build client certificate verifier")?;
                builder.with_client_cert_verifier(client_verifier)
            }
            None => builder.with_no_client_auth(),
        };

        builder
            .with_single_cert(load_certs(&options.cert)?, load_key(&options.key)?)
            .context("Failed to configure server certificate")
    }

    /// Build the server side of a handshake from server options
    pub fn server_tls(options: &TlsServerOptions) -> Result<ServerTls, SocketError> {
        let config = make_server_config(options).map_err(bad_config)?;
        Ok(ServerTls {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            certificate: leaf_certificate(&options.cert).map_err(bad_config)?,
        })
    }

    /// Run the client handshake over an established TCP stream
    pub async fn connect_tls(tls: ClientTls, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!("Connecting via TLS to {} (SNI: {:?})", peer_addr, tls.server_name);

        let connector = TlsConnector::from(tls.config);
        let tls_stream = connector
            .connect(tls.server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

        debug!("TLS connection established with {}", peer_addr);
        Ok(IoStream::TlsClient(tls_stream))
    }

    /// Run the server handshake over an accepted TCP stream
    pub async fn accept_tls(acceptor: &TlsAcceptor, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!("Accepting TLS connection from {}", peer_addr);

        let tls_stream = acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

        debug!("TLS connection accepted from {}", peer_addr);
        Ok(IoStream::Tls(tls_stream))
    }

    /// Verifier used when `checkValidity` is off
    #[derive(Debug)]
    struct AcceptAnyServerCert(Arc<CryptoProvider>);

    impl AcceptAnyServerCert {
        fn new() -> Self {
            Self(Arc::new(rustls::crypto::ring::default_provider()))
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
