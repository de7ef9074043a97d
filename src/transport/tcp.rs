//! Raw TCP (for testing and debugging fronts over loopback)

use super::{TlsProvider, TlsSession, TransportError};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Open a TCP connection with a deadline and Nagle disabled
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Io)?;

    // Configure TCP options
    stream.set_nodelay(true).ok();

    Ok(stream)
}

/// Provider that skips TLS entirely
///
/// `alpn` is reported as if it had been negotiated, so a loopback h2c
/// server can stand in for an HTTP/2 front.
#[derive(Debug, Clone, Default)]
pub struct PlainTcpProvider {
    alpn: Option<Vec<u8>>,
}

impl PlainTcpProvider {
    /// Speak HTTP/1.1 on every connection
    pub fn http1() -> Self {
        Self { alpn: None }
    }

    /// Speak HTTP/2 (prior knowledge) on every connection
    pub fn http2() -> Self {
        Self {
            alpn: Some(b"h2".to_vec()),
        }
    }
}

#[async_trait]
impl TlsProvider for PlainTcpProvider {
    async fn connect_tls(
        &self,
        ip: IpAddr,
        port: u16,
        _sni: &str,
        timeout: Duration,
    ) -> Result<TlsSession, TransportError> {
        let started = Instant::now();
        let stream = connect_tcp(SocketAddr::new(ip, port), timeout).await?;

        Ok(TlsSession {
            stream: Box::new(stream),
            alpn: self.alpn.clone(),
            handshake: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_provider_echo() {
        // Start a simple echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let provider = PlainTcpProvider::http2();
        let mut session = provider
            .connect_tls(addr.ip(), addr.port(), "ignored.example", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(session.is_h2());

        session.stream.write_all(b"Hello, TCP!").await.unwrap();
        let mut buf = [0u8; 1024];
        let n = session.stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, TCP!");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and release it so nothing listens there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = PlainTcpProvider::http1()
            .connect_tls(addr.ip(), addr.port(), "x", Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
