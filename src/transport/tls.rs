//! TLS via rustls with fingerprint mimicry
//!
//! ## Fingerprint Mimicry
//!
//! The ClientHello is shaped after the configured [`BrowserProfile`]:
//! - Cipher suite ordering matches Chrome/Firefox/Safari
//! - ALPN offers `h2` then `http/1.1`
//! - Session resumption enabled (browsers do this)
//!
//! ## Fronting
//!
//! The SNI on the wire is usually a generated name that the front accepts
//! but that does not appear in its certificate. [`FrontCertVerifier`]
//! therefore runs the normal webpki chain validation against the front's
//! configured `cert_name` instead of the presented SNI.

use super::{BrowserProfile, TlsProvider, TlsSession, TransportError};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring as ring_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedCipherSuite};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

/// Certificate verifier that checks the chain against a fixed name
#[derive(Debug)]
pub struct FrontCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: Option<ServerName<'static>>,
}

impl FrontCertVerifier {
    /// `cert_name = None` verifies against the SNI as usual
    pub fn new(
        provider: Arc<CryptoProvider>,
        cert_name: Option<&str>,
    ) -> Result<Self, TransportError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let expected = cert_name
            .map(|name| {
                ServerName::try_from(name.to_string())
                    .map_err(|e| TransportError::InvalidSni(format!("{}: {}", name, e)))
            })
            .transpose()?;

        Ok(Self { inner, expected })
    }
}

impl ServerCertVerifier for FrontCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let name = self.expected.as_ref().unwrap_or(server_name);
        self.inner
            .verify_server_cert(end_entity, intermediates, name, ocsp_response, now)
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

/// Build a rustls ClientConfig that mimics a browser fingerprint
pub fn build_tls_config(
    profile: BrowserProfile,
    cert_name: Option<&str>,
) -> Result<ClientConfig, TransportError> {
    let profile = profile.resolve();

    // Create crypto provider with specific cipher suite order
    let crypto_provider = Arc::new(CryptoProvider {
        cipher_suites: get_cipher_suites(profile),
        ..ring_provider::default_provider()
    });
    let verifier = FrontCertVerifier::new(crypto_provider.clone(), cert_name)?;

    let mut tls_config = ClientConfig::builder_with_provider(crypto_provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    tls_config.alpn_protocols = profile.alpn_protocols();
    tls_config.resumption = rustls::client::Resumption::default();

    Ok(tls_config)
}

/// Get cipher suites ordered to match browser profile
fn get_cipher_suites(profile: BrowserProfile) -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;

    match profile {
        BrowserProfile::Chrome | BrowserProfile::Edge => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        BrowserProfile::Firefox => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ],
        BrowserProfile::Safari => vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        BrowserProfile::Random => get_cipher_suites(BrowserProfile::random()),
    }
}

/// TLS provider backed by rustls
#[derive(Clone)]
pub struct RustlsProvider {
    connector: TlsConnector,
    profile: BrowserProfile,
}

impl RustlsProvider {
    pub fn new(profile: BrowserProfile, cert_name: Option<&str>) -> Result<Self, TransportError> {
        let profile = profile.resolve();
        let config = build_tls_config(profile, cert_name)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            profile,
        })
    }

    /// The concrete profile in use (never `Random`)
    pub fn profile(&self) -> BrowserProfile {
        self.profile
    }
}

#[async_trait]
impl TlsProvider for RustlsProvider {
    async fn connect_tls(
        &self,
        ip: IpAddr,
        port: u16,
        sni: &str,
        timeout: Duration,
    ) -> Result<TlsSession, TransportError> {
        let started = Instant::now();

        // Parse SNI (this is what appears in the ClientHello)
        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|e| TransportError::InvalidSni(format!("{}: {}", sni, e)))?;

        let attempt = async {
            let tcp_stream = super::connect_tcp(SocketAddr::new(ip, port), timeout).await?;
            self.connector
                .connect(server_name, tcp_stream)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))
        };
        let tls_stream = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout)??;

        let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());

        Ok(TlsSession {
            stream: Box::new(tls_stream),
            alpn,
            handshake: started.elapsed(),
        })
    }
}
