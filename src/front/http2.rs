//! HTTP/2 worker: many exchanges multiplexed on one connection
//!
//! The `h2` connection future is driven by a spawned task; each request
//! opens its own stream. Stream-level and connection-level flow control
//! are enforced by `h2`; the worker only releases receive capacity as it
//! consumes data and waits for send capacity before writing.

use super::{ConnectionInfo, FrontConnection, FrontError, HttpRequest, HttpResponse, WorkerState};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use h2::client::SendRequest;
use h2::SendStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Connection-specific headers that must not appear in HTTP/2
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct Http2Settings {
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    /// Streams we open at once on one connection
    pub max_concurrent: usize,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            initial_window_size: 1024 * 1024,
            initial_connection_window_size: 8 * 1024 * 1024,
            max_concurrent: 60,
        }
    }
}

/// Lifecycle of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Open,
    HeadersReceived,
    BodyStreaming,
    Closed,
}

type PhaseTable = Mutex<HashMap<u64, StreamPhase>>;

/// Removes a stream from the phase table however the exchange ends
struct PhaseGuard<'a> {
    table: &'a PhaseTable,
    id: u64,
}

impl PhaseGuard<'_> {
    fn set(&self, phase: StreamPhase) {
        if let Some(p) = self.table.lock().unwrap_or_else(|e| e.into_inner()).get_mut(&self.id) {
            *p = phase;
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
    }
}

/// HTTP/2 connection
pub struct Http2Worker {
    info: ConnectionInfo,
    sender: SendRequest<Bytes>,
    state: Arc<WorkerState>,
    streams: PhaseTable,
    next_stream: AtomicU64,
    settings: Http2Settings,
}

impl Http2Worker {
    /// Run the client preface and spawn the connection driver
    pub async fn handshake(
        stream: BoxedStream,
        info: ConnectionInfo,
        settings: Http2Settings,
    ) -> Result<Self, FrontError> {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(settings.initial_window_size)
            .initial_connection_window_size(settings.initial_connection_window_size)
            .enable_push(false);
        let (sender, connection) = builder.handshake::<_, Bytes>(stream).await?;

        let state = Arc::new(WorkerState::new());
        let driver = Arc::clone(&state);
        let label = info.peer_label();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        debug!("HTTP/2 connection {} ended: {}", label, e);
                    }
                }
                _ = driver.cancelled().cancelled() => {
                    trace!("HTTP/2 connection {} closed locally", label);
                }
            }
            driver.close();
        });

        Ok(Self {
            info,
            sender,
            state,
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            settings,
        })
    }

    /// Phase of every exchange currently on the connection
    pub fn stream_phases(&self) -> Vec<StreamPhase> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .copied()
            .collect()
    }

    async fn send_body(send: &mut SendStream<Bytes>, mut body: Bytes) -> Result<(), FrontError> {
        while !body.is_empty() {
            send.reserve_capacity(body.len());
            let capacity = poll_fn(|cx| send.poll_capacity(cx))
                .await
                .ok_or(FrontError::ConnectionClosed)??;
            if capacity == 0 {
                continue;
            }
            let chunk = body.split_to(capacity.min(body.len()));
            send.send_data(chunk, body.is_empty())?;
        }
        Ok(())
    }

    async fn exchange(&self, req: &HttpRequest, phase: &PhaseGuard<'_>) -> Result<HttpResponse, FrontError> {
        let mut sender = self.sender.clone().ready().await?;

        let uri = format!("https://{}{}", self.info.identity.host, req.path);
        let mut builder = http::Request::builder().method(req.method.clone()).uri(uri);
        for (name, value) in &req.headers {
            if HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name.to_ascii_lowercase(), value.as_str());
        }
        let request = builder
            .body(())
            .map_err(|e| FrontError::InvalidRequest(e.to_string()))?;

        let end_of_stream = req.body.is_empty();
        let (response, mut send) = sender.send_request(request, end_of_stream)?;
        if !end_of_stream {
            Self::send_body(&mut send, req.body.clone()).await?;
        }

        let (head, mut recv) = response.await?.into_parts();
        phase.set(StreamPhase::HeadersReceived);

        let mut body = BytesMut::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk?;
            phase.set(StreamPhase::BodyStreaming);
            let _ = recv.flow_control().release_capacity(chunk.len());
            body.extend_from_slice(&chunk);
        }
        phase.set(StreamPhase::Closed);

        let headers = head
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();

        Ok(HttpResponse {
            status: head.status.as_u16(),
            headers,
            body: body.freeze(),
        })
    }
}

#[async_trait]
impl FrontConnection for Http2Worker {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, FrontError> {
        if self.state.is_closed() {
            return Err(FrontError::ConnectionClosed);
        }

        // A dropped exchange only resets its own stream.
        let guard = self.state.begin(false);
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, StreamPhase::Open);
        let phase = PhaseGuard {
            table: &self.streams,
            id,
        };

        match tokio::time::timeout(req.timeout, self.exchange(&req, &phase)).await {
            Ok(Ok(response)) => {
                guard.finish();
                Ok(response)
            }
            Ok(Err(e)) => {
                if let FrontError::H2(ref err) = e {
                    if err.is_io() || err.is_go_away() {
                        self.close();
                    }
                }
                debug!("HTTP/2 exchange on {} failed: {}", self.info.peer_label(), e);
                Err(e)
            }
            Err(_) => Err(FrontError::Timeout),
        }
    }

    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn in_flight(&self) -> usize {
        self.state.in_flight()
    }

    fn accepts_request(&self) -> bool {
        !self.state.is_closed() && self.state.in_flight() < self.settings.max_concurrent.max(1)
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    fn close(&self) {
        if self.state.close() {
            debug!("Closing {}", self.info.peer_label());
        }
    }

    fn last_active(&self) -> Instant {
        self.state.last_active()
    }

    fn processed(&self) -> u64 {
        self.state.processed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::HttpVersion;
    use crate::identity::Identity;
    use http::Method;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    /// h2c server that echoes the request body with the path in a header
    async fn echo_server(listener: TcpListener) {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut conn = match h2::server::handshake(socket).await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                while let Some(Ok((request, mut respond))) = conn.accept().await {
                    tokio::spawn(async move {
                        let path = request.uri().path().to_string();
                        let mut body = request.into_body();
                        let mut data = BytesMut::new();
                        while let Some(Ok(chunk)) = body.data().await {
                            let _ = body.flow_control().release_capacity(chunk.len());
                            data.extend_from_slice(&chunk);
                        }
                        if path == "/slow" {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                        let response = http::Response::builder()
                            .status(200)
                            .header("x-path", path)
                            .body(())
                            .unwrap();
                        if let Ok(mut send) = respond.send_response(response, false) {
                            let _ = send.send_data(data.freeze(), true);
                        }
                    });
                }
            });
        }
    }

    async fn worker() -> Http2Worker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(echo_server(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let info = ConnectionInfo::new(
            addr.ip(),
            addr.port(),
            Identity {
                sni: "sni.example".into(),
                host: "front.example".into(),
                app_id: None,
            },
            HttpVersion::Http2,
            Duration::ZERO,
            Duration::from_secs(60),
        );
        Http2Worker::handshake(Box::new(stream), info, Http2Settings::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_exchanges() {
        let worker = Arc::new(worker().await);

        let mut tasks = Vec::new();
        for i in 0..10u8 {
            let worker = worker.clone();
            tasks.push(tokio::spawn(async move {
                let body = Bytes::from(vec![i; 100_000]);
                let req = HttpRequest::new(Method::POST, format!("/data?tid={}", i), Duration::from_secs(5))
                    .body(body.clone());
                let resp = worker.request(req).await.unwrap();
                assert_eq!(resp.status, 200);
                assert_eq!(resp.header("x-path"), Some("/data"));
                assert_eq!(resp.body, body);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(worker.processed(), 10);
        assert_eq!(worker.in_flight(), 0);
        assert!(worker.stream_phases().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_resets_only_the_stream() {
        let worker = worker().await;

        let slow = HttpRequest::new(Method::GET, "/slow", Duration::from_millis(100));
        assert!(matches!(worker.request(slow).await, Err(FrontError::Timeout)));
        assert!(!worker.is_closed());

        let ok = HttpRequest::new(Method::GET, "/fast", Duration::from_secs(5));
        assert_eq!(worker.request(ok).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_close_stops_driver() {
        let worker = worker().await;
        worker.close();
        assert!(worker.is_closed());
        assert!(!worker.accepts_request());

        let req = HttpRequest::new(Method::GET, "/", Duration::from_secs(1));
        assert!(worker.request(req).await.is_err());
    }
}
