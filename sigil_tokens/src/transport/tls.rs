use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};

use super::{Transport, TrustAnchor};

/// How long a single poll of the socket may block
const POLL_TIMEOUT: Duration = Duration::from_millis(5);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`Transport`] over `std::net` and `rustls`
///
/// Trusts the bundled web PKI roots until told otherwise.
pub struct TlsTransport {
    config: Arc<ClientConfig>,
    stream: Option<StreamOwned<ClientConnection, TcpStream>>,
    timeout: Duration,
    buffer: Vec<u8>,
    eof: bool,
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("connected", &self.stream.is_some())
            .field("timeout", &self.timeout)
            .field("buffered", &self.buffer.len())
            .field("eof", &self.eof)
            .finish()
    }
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsTransport {
    /// Constructs a transport trusting the bundled web PKI roots
    pub fn new() -> Self {
        Self {
            config: Arc::new(system_roots_config()),
            stream: None,
            timeout: DEFAULT_TIMEOUT,
            buffer: Vec::new(),
            eof: false,
        }
    }

    fn open(&self, host: &str, port: u16) -> io::Result<StreamOwned<ClientConnection, TcpStream>> {
        let mut last_err = None;
        let mut tcp = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let mut tcp = tcp.ok_or_else(|| {
            last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
            })
        })?;

        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut conn = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(handshake_error)?;
        }

        tcp.set_read_timeout(Some(POLL_TIMEOUT))?;

        Ok(StreamOwned::new(conn, tcp))
    }

    fn fill(&mut self) -> io::Result<()> {
        let stream = match &mut self.stream {
            Some(stream) if !self.eof => stream,
            _ => return Ok(()),
        };

        let mut chunk = [0; 2048];
        match stream.read(&mut chunk) {
            Ok(0) => self.eof = true,
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => self.eof = true,
            Err(err) => return Err(err),
        }

        if self.eof {
            tracing::trace!(buffered = self.buffer.len(), "peer closed connection");
        }
        Ok(())
    }
}

/// Socket timeouts surface as `WouldBlock` on some platforms
fn handshake_error(err: io::Error) -> io::Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
        }
        _ => err,
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        self.stop();
        let stream = self.open(host, port)?;
        tracing::trace!(host, port, "TLS connection established");
        self.stream = Some(stream);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.stream.is_some() && !(self.eof && self.buffer.is_empty())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => {
                let n = stream.write(buf)?;
                stream.flush()?;
                Ok(n)
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            self.fill()?;
        }
        let n = self.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }

    fn available(&mut self) -> io::Result<usize> {
        if self.buffer.is_empty() {
            self.fill()?;
        }
        Ok(self.buffer.len())
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            let _ = stream.conn.complete_io(&mut stream.sock);
            let _ = stream.sock.shutdown(Shutdown::Both);
        }
        self.buffer.clear();
        self.eof = false;
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        let config = match trust {
            TrustAnchor::Insecure => {
                tracing::warn!("server certificates will not be verified");
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                    .with_no_client_auth()
            }
            TrustAnchor::SystemRoots => system_roots_config(),
            TrustAnchor::CaCertPem(pem) => {
                let mut root_store = RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
                    root_store
                        .add(cert?)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                if root_store.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "no certificates found in CA PEM",
                    ));
                }
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
        };

        self.config = Arc::new(config);
        Ok(())
    }
}

fn system_roots_config() -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn empty_ca_pem_is_rejected() {
        let mut transport = TlsTransport::new();
        let err = transport
            .set_trust(&TrustAnchor::CaCertPem(String::new()))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn insecure_and_system_roots_configure() -> Result<()> {
        let mut transport = TlsTransport::new();
        transport.set_trust(&TrustAnchor::Insecure)?;
        transport.set_trust(&TrustAnchor::SystemRoots)?;
        assert!(!transport.connected());
        Ok(())
    }

    #[test]
    fn silent_server_times_out_handshake() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || {
            let accepted = listener.accept();
            std::thread::sleep(Duration::from_millis(500));
            drop(accepted);
        });

        let mut transport = TlsTransport::new();
        transport.set_timeout(Duration::from_millis(50));
        let err = transport.connect("localhost", port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!transport.connected());

        server.join().ok();
        Ok(())
    }

    #[test]
    fn io_without_connection_fails() {
        let mut transport = TlsTransport::new();
        let err = transport.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert_eq!(transport.available().ok(), Some(0));
    }
}
