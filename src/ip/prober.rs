//! IP health prober
//!
//! Stateless: it opens a connection, issues one GET and classifies the
//! answer. Scoring and eviction are left to the caller.

use crate::config::FrontConfig;
use crate::front::{
    open_connection, FrontConnection, FrontError, Http2Settings, HttpRequest, HttpVersion,
};
use crate::identity::{Identity, IdentityError, IdentitySelector};
use crate::transport::{TlsProvider, TransportError};
use http::Method;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Why a probe failed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Connect failed: {0}")]
    Connect(#[from] TransportError),

    #[error("Identity unavailable: {0}")]
    Identity(#[from] IdentityError),

    #[error("Request failed: {0}")]
    Request(#[from] FrontError),

    #[error("Unexpected status {0}")]
    BadStatus(u16),

    #[error("Response does not contain the check marker")]
    ContentMismatch,
}

impl ProbeError {
    /// The front answered, but not as our front would: the identity (or the
    /// IP's role) is wrong, not just the network path
    pub fn is_identity_rejection(&self) -> bool {
        matches!(self, ProbeError::BadStatus(_) | ProbeError::ContentMismatch)
    }
}

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub port: u16,
    pub path: String,
    /// Marker the body must contain, if set
    pub content: Option<String>,
    pub accept_status: Vec<u16>,
    pub timeout: Duration,
    pub user_agent: String,
    pub connection_max_life: Duration,
    pub h2: Http2Settings,
}

impl ProberConfig {
    pub fn from_front(front: &FrontConfig) -> Self {
        Self {
            port: front.port,
            path: front.check_ip_path.clone(),
            content: front.check_ip_content.clone().filter(|c| !c.is_empty()),
            accept_status: front.check_ip_accept_status.clone(),
            timeout: front.connect_timeout(),
            user_agent: front.browser_profile().user_agent().to_string(),
            connection_max_life: front.connection_max_life(),
            h2: Http2Settings {
                max_concurrent: front.http2_target_concurrent,
                ..Http2Settings::default()
            },
        }
    }
}

/// A usable endpoint
pub struct ProbeResult {
    pub ip: IpAddr,
    pub identity: Identity,
    pub version: HttpVersion,
    pub status: u16,
    /// TCP connect + TLS handshake
    pub handshake: Duration,
    /// Request sent to first (whole) response
    pub first_byte: Duration,
    /// The probed connection, open and ready for reuse
    pub connection: Arc<dyn FrontConnection>,
}

impl std::fmt::Debug for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeResult")
            .field("ip", &self.ip)
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("handshake", &self.handshake)
            .field("first_byte", &self.first_byte)
            .finish()
    }
}

pub struct Prober {
    tls: Arc<dyn TlsProvider>,
    identity: Arc<IdentitySelector>,
    config: ProberConfig,
}

impl Prober {
    pub fn new(tls: Arc<dyn TlsProvider>, identity: Arc<IdentitySelector>, config: ProberConfig) -> Self {
        Self {
            tls,
            identity,
            config,
        }
    }

    pub fn config(&self) -> &ProberConfig {
        &self.config
    }

    /// Probe `ip`; `sni`, `host` and `path` override the defaults
    pub async fn check(
        &self,
        ip: IpAddr,
        sni: Option<&str>,
        host: Option<&str>,
        path: Option<&str>,
        headers: Vec<(String, String)>,
    ) -> Result<ProbeResult, ProbeError> {
        let identity = self.identity.build(sni, host)?;

        let session = self
            .tls
            .connect_tls(ip, self.config.port, &identity.sni, self.config.timeout)
            .await?;
        let handshake = session.handshake;

        let connection = open_connection(
            session,
            ip,
            self.config.port,
            identity.clone(),
            self.config.connection_max_life,
            &self.config.h2,
        )
        .await?;

        let mut req = HttpRequest::new(
            Method::GET,
            path.unwrap_or(&self.config.path),
            self.config.timeout,
        )
        .header("User-Agent", self.config.user_agent.as_str())
        .header("Accept", "*/*");
        req.headers.extend(headers);

        let started = Instant::now();
        let response = match connection.request(req).await {
            Ok(r) => r,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };
        let first_byte = started.elapsed();

        if !self.config.accept_status.contains(&response.status) {
            debug!("Probe {} ({}) got status {}", ip, identity.host, response.status);
            connection.close();
            return Err(ProbeError::BadStatus(response.status));
        }

        if let Some(marker) = self.config.content.as_deref().filter(|m| !m.is_empty()) {
            let found = response
                .body
                .windows(marker.len())
                .any(|w| w == marker.as_bytes());
            if !found {
                debug!("Probe {} ({}) content mismatch", ip, identity.host);
                connection.close();
                return Err(ProbeError::ContentMismatch);
            }
        }

        debug!(
            "Probe {} ok: {} handshake={}ms request={}ms",
            ip,
            connection.version(),
            handshake.as_millis(),
            first_byte.as_millis()
        );

        Ok(ProbeResult {
            ip,
            version: connection.version(),
            identity,
            status: response.status,
            handshake,
            first_byte,
            connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HostManager, SniManager};
    use crate::transport::PlainTcpProvider;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        addr
    }

    fn prober(port: u16, content: Option<&str>) -> Prober {
        let identity = Arc::new(IdentitySelector::new(
            SniManager::builtin(),
            HostManager::fixed("front.example"),
        ));
        let config = ProberConfig {
            port,
            content: content.map(String::from),
            ..ProberConfig::from_front(&FrontConfig::default())
        };
        Prober::new(Arc::new(PlainTcpProvider::http1()), identity, config)
    }

    #[tokio::test]
    async fn test_probe_success_returns_connection() {
        let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nGFE/2.0 ok!").await;
        let result = prober(addr.port(), Some("GFE"))
            .check(addr.ip(), None, None, None, Vec::new())
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.identity.host, "front.example");
        assert_eq!(result.version, HttpVersion::Http1);
        assert!(!result.connection.is_closed());
    }

    #[tokio::test]
    async fn test_probe_content_mismatch() {
        let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nnginx").await;
        let err = prober(addr.port(), Some("GFE"))
            .check(addr.ip(), None, None, None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ContentMismatch));
        assert!(err.is_identity_rejection());
    }

    #[tokio::test]
    async fn test_empty_content_marker_skips_check() {
        let addr = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let result = prober(addr.port(), Some(""))
            .check(addr.ip(), None, None, None, Vec::new())
            .await
            .unwrap();
        assert_eq!(result.status, 200);
    }

    #[tokio::test]
    async fn test_probe_bad_status() {
        let addr = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let err = prober(addr.port(), None)
            .check(addr.ip(), None, Some("missing.appspot.com"), None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::BadStatus(404)));
    }

    #[tokio::test]
    async fn test_probe_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = prober(addr.port(), None)
            .check(addr.ip(), None, None, None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
        assert!(!err.is_identity_rejection());
    }
}
