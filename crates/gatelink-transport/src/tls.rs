//! TLS connection to the gateway
//!
//! The gateway is identified by the subject common name of its certificate,
//! which must equal the configured gateway host exactly. The chain itself is
//! still validated by webpki against the configured CA (or the webpki roots);
//! only webpki's SAN name check is replaced by the CN comparison.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::TransportError;

/// TLS connection to the gateway
pub type GatewayStream = TlsStream<TcpStream>;

/// Client-side TLS options
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Trust anchors for the gateway chain. Empty means the webpki roots.
    pub ca_certificates: Vec<CertificateDer<'static>>,
    /// Skip all server verification (INSECURE, development only)
    pub insecure: bool,
    /// Limit for TCP connect and for the TLS handshake, each
    pub connect_timeout: Duration,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ca_certificates: Vec::new(),
            insecure: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Cipher suites the agent offers. Nothing outside AEAD with forward secrecy.
fn restricted_provider() -> CryptoProvider {
    use ring::cipher_suite::*;

    CryptoProvider {
        cipher_suites: vec![
            TLS13_AES_256_GCM_SHA384,
            TLS13_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ],
        ..ring::default_provider()
    }
}

/// Dials the gateway and completes the TLS handshake
#[derive(Clone)]
pub struct GatewayConnector {
    connector: TlsConnector,
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl std::fmt::Debug for GatewayConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl GatewayConnector {
    pub fn new(host: &str, port: u16, settings: &TlsSettings) -> Result<Self, TransportError> {
        let provider = Arc::new(restricted_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(format!("Unsupported protocol versions: {}", e)))?;

        let verifier: Arc<dyn ServerCertVerifier> = if settings.insecure {
            warn!("Gateway certificate verification is DISABLED");
            Arc::new(SkipVerification { provider })
        } else {
            let mut roots = RootCertStore::empty();
            if settings.ca_certificates.is_empty() {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            } else {
                for cert in &settings.ca_certificates {
                    roots
                        .add(cert.clone())
                        .map_err(|e| TransportError::Tls(format!("Invalid CA cert: {}", e)))?;
                }
            }

            let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TransportError::Tls(format!("Failed to build verifier: {}", e)))?;

            Arc::new(CommonNameVerifier {
                inner,
                expected: host.to_string(),
            })
        };

        let config = builder
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            host: host.to_string(),
            port,
            connect_timeout: settings.connect_timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open a TCP connection to the gateway and run the TLS handshake
    pub async fn connect(&self) -> Result<GatewayStream, TransportError> {
        debug!("Connecting to gateway {}:{}", self.host, self.port);

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        let _ = tcp.set_nodelay(true);

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| TransportError::InvalidServerName(format!("{}: {}", self.host, e)))?;

        let stream = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        debug!("TLS established with {}:{}", self.host, self.port);
        Ok(stream)
    }
}

/// Load PEM certificates to use as gateway trust anchors
pub fn load_ca_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open CA file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse CA file: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn subject_common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Chain validation from webpki, name validation against the subject CN
#[derive(Debug)]
struct CommonNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: String,
}

impl ServerCertVerifier for CommonNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            // SAN mismatch; the CN comparison below decides
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(e) => return Err(e),
        }

        let cn = subject_common_name(end_entity.as_ref()).ok_or_else(|| {
            rustls::Error::General("gateway certificate has no subject common name".to_string())
        })?;

        if cn != self.expected {
            return Err(rustls::Error::General(format!(
                "gateway certificate common name '{}' does not match '{}'",
                cn, self.expected
            )));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipVerification {
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
