//! Fronts: disguised HTTP(S) channels
//!
//! ```text
//! Front ──► ConnectCreator ──► IpPool + IdentitySelector + TlsProvider
//!   │
//!   └─► FrontConnection (Http1Worker | Http2Worker)
//! ```
//!
//! A [`Front`] owns a handful of [`FrontConnection`]s and exposes a single
//! `request()`; the tunnel only sees the [`FrontRequester`] trait.

mod builder;
mod creator;
mod dispatcher;
mod http1;
mod http2;

pub use builder::FrontStack;
pub use creator::{AppidProbe, ConnectCreator};
pub use dispatcher::{Front, FrontSettings};
pub use http1::Http1Worker;
pub use http2::{Http2Settings, Http2Worker, StreamPhase};

use crate::identity::{Identity, IdentityError};
use crate::ip::IpError;
use crate::transport::{TlsSession, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Front errors
#[derive(Debug, Error)]
pub enum FrontError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("No connection available")]
    Busy,

    #[error("Request timed out")]
    Timeout,

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("IP pool error: {0}")]
    Pool(#[from] IpError),

    #[error("Connect failed after {attempts} attempts: {last}")]
    ConnectFailed { attempts: usize, last: String },

    #[error("Request failed after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: String },

    #[error("Front closed")]
    Closed,
}

/// Negotiated HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1,
    Http2,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpVersion::Http1 => write!(f, "HTTP/1.1"),
            HttpVersion::Http2 => write!(f, "HTTP/2"),
        }
    }
}

/// One request on a front connection
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// Fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Static facts about an established connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub identity: Identity,
    pub version: HttpVersion,
    pub created_at: Instant,
    /// TCP connect + TLS handshake time
    pub handshake: Duration,
    /// Retire the connection after this point
    pub life_end: Instant,
}

impl ConnectionInfo {
    /// Life end is drawn from `[max_life, 1.5 * max_life]` so connections
    /// opened together do not all expire together
    pub fn new(
        ip: IpAddr,
        port: u16,
        identity: Identity,
        version: HttpVersion,
        handshake: Duration,
        max_life: Duration,
    ) -> Self {
        let created_at = Instant::now();
        let spread = (max_life.as_millis() / 2) as u64;
        let extra = rand::rng().random_range(0..=spread);
        Self {
            ip,
            port,
            identity,
            version,
            created_at,
            handshake,
            life_end: created_at + max_life + Duration::from_millis(extra),
        }
    }

    pub fn peer_label(&self) -> String {
        format!(
            "{}:{} {} sni={} host={}",
            self.ip, self.port, self.version, self.identity.sni, self.identity.host
        )
    }
}

/// A connection a front can send requests over
#[async_trait]
pub trait FrontConnection: Send + Sync {
    /// Send one request and read the whole response
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, FrontError>;

    fn info(&self) -> &ConnectionInfo;

    /// Requests currently on the wire
    fn in_flight(&self) -> usize;

    /// Whether another request can start right now
    fn accepts_request(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Retire the connection; safe to call more than once
    fn close(&self);

    fn last_active(&self) -> Instant;

    /// Completed requests
    fn processed(&self) -> u64;

    fn version(&self) -> HttpVersion {
        self.info().version
    }

    fn peer_label(&self) -> String {
        self.info().peer_label()
    }
}

/// Counters shared by both worker kinds
pub(crate) struct WorkerState {
    in_flight: AtomicUsize,
    processed: AtomicU64,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
}

impl WorkerState {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true only for the call that actually closed it
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        first
    }

    pub(crate) fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub(crate) fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track one exchange; if the guard is dropped without `finish` and
    /// `close_on_cancel` is set, the connection is closed
    pub(crate) fn begin(&self, close_on_cancel: bool) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        InFlight {
            state: self,
            close_on_cancel,
            done: false,
        }
    }
}

pub(crate) struct InFlight<'a> {
    state: &'a WorkerState,
    close_on_cancel: bool,
    done: bool,
}

impl InFlight<'_> {
    pub(crate) fn finish(mut self) {
        self.done = true;
        self.state.processed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.state.touch();
        if !self.done && self.close_on_cancel {
            self.state.close();
        }
    }
}

/// Wrap an established session in the worker matching its ALPN
pub async fn open_connection(
    session: TlsSession,
    ip: IpAddr,
    port: u16,
    identity: Identity,
    max_life: Duration,
    h2: &Http2Settings,
) -> Result<Arc<dyn FrontConnection>, FrontError> {
    let version = if session.is_h2() {
        HttpVersion::Http2
    } else {
        HttpVersion::Http1
    };
    let info = ConnectionInfo::new(ip, port, identity, version, session.handshake, max_life);

    match version {
        HttpVersion::Http2 => {
            let worker = Http2Worker::handshake(session.stream, info, h2.clone()).await?;
            Ok(Arc::new(worker))
        }
        HttpVersion::Http1 => Ok(Arc::new(Http1Worker::new(session.stream, info))),
    }
}

/// What the tunnel needs from a front
#[async_trait]
pub trait FrontRequester: Send + Sync {
    fn name(&self) -> &str;

    /// Lower is better; `None` while the front is blocked by recent failures
    fn score(&self) -> Option<u64>;

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: Vec<(String, String)>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, FrontError>;

    fn status(&self) -> String {
        format!("{}: score={:?}", self.name(), self.score())
    }

    fn close(&self) {}
}
