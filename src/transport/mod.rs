//! Transport layer
//!
//! The core only ever asks for "a TLS socket to IP X with SNI Y". The
//! [`TlsProvider`] trait is that seam:
//! - [`RustlsProvider`]: rustls with a browser-like ClientHello and
//!   certificate checks against the front's real name
//! - [`PlainTcpProvider`]: unencrypted TCP (loopback tests, debugging)

mod fingerprint;
mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use fingerprint::BrowserProfile;
pub use tcp::{connect_tcp, PlainTcpProvider};

#[cfg(feature = "tls")]
pub use tls::{build_tls_config, FrontCertVerifier, RustlsProvider};

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid SNI: {0}")]
    InvalidSni(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Byte stream handed back by a provider
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased provider stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// An established (TLS) session
pub struct TlsSession {
    pub stream: BoxedStream,
    /// Negotiated ALPN protocol, if any
    pub alpn: Option<Vec<u8>>,
    /// Time spent on TCP connect + handshake
    pub handshake: Duration,
}

impl TlsSession {
    /// Whether the peer agreed to speak HTTP/2
    pub fn is_h2(&self) -> bool {
        self.alpn.as_deref() == Some(b"h2".as_slice())
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("handshake", &self.handshake)
            .finish()
    }
}

/// External TLS provider
#[async_trait]
pub trait TlsProvider: Send + Sync {
    /// Connect to `ip:port` presenting `sni`; the whole attempt is bounded by `timeout`
    async fn connect_tls(
        &self,
        ip: IpAddr,
        port: u16,
        sni: &str,
        timeout: Duration,
    ) -> Result<TlsSession, TransportError>;
}
