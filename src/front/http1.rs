//! HTTP/1.1 worker: one exchange at a time over one connection

use super::{ConnectionInfo, FrontConnection, FrontError, HttpRequest, HttpResponse, WorkerState};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Largest response head we accept
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// Default cap on a response body
pub const MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

struct Http1Io {
    stream: BoxedStream,
    buf: BytesMut,
    max_body: usize,
}

impl Http1Io {
    /// Read more bytes into the buffer; EOF is an error
    async fn fill(&mut self) -> Result<(), FrontError> {
        if self.buf.capacity() - self.buf.len() < 4096 {
            self.buf.reserve(16 * 1024);
        }
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(FrontError::ConnectionClosed);
        }
        Ok(())
    }

    async fn write_request(&mut self, host: &str, req: &HttpRequest) -> Result<(), FrontError> {
        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method, req.path, host);
        for (name, value) in &req.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !req.body.is_empty() || req.method == Method::POST {
            head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
        }
        head.push_str("\r\n");

        self.stream.write_all(head.as_bytes()).await?;
        if !req.body.is_empty() {
            self.stream.write_all(&req.body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Parse the status line and headers, skipping `1xx` interim responses
    async fn read_head(&mut self) -> Result<(u16, Vec<(String, String)>), FrontError> {
        loop {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut response = httparse::Response::new(&mut headers);
                match response.parse(&self.buf) {
                    Ok(httparse::Status::Complete(len)) => {
                        let status = response.code.unwrap_or(0);
                        let headers: Vec<(String, String)> = response
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).into_owned(),
                                )
                            })
                            .collect();
                        Some((len, status, headers))
                    }
                    Ok(httparse::Status::Partial) => None,
                    Err(e) => return Err(FrontError::Malformed(e.to_string())),
                }
            };

            match parsed {
                Some((len, status, headers)) => {
                    self.buf.advance(len);
                    if (100..200).contains(&status) {
                        continue;
                    }
                    return Ok((status, headers));
                }
                None => {
                    if self.buf.len() > MAX_HEAD_SIZE {
                        return Err(FrontError::Malformed("response head too large".into()));
                    }
                    self.fill().await?;
                }
            }
        }
    }

    fn check_body_size(&self, len: usize) -> Result<(), FrontError> {
        if len > self.max_body {
            return Err(FrontError::Malformed(format!(
                "body of {} bytes exceeds limit {}",
                len, self.max_body
            )));
        }
        Ok(())
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes, FrontError> {
        while self.buf.len() < len {
            self.fill().await?;
        }
        Ok(self.buf.split_to(len).freeze())
    }

    async fn read_line(&mut self) -> Result<BytesMut, FrontError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_HEAD_SIZE {
                return Err(FrontError::Malformed("chunk header too large".into()));
            }
            self.fill().await?;
        }
    }

    async fn read_chunked(&mut self) -> Result<Bytes, FrontError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let text = String::from_utf8_lossy(&line);
            let size_text = text.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| FrontError::Malformed(format!("bad chunk size {:?}", size_text)))?;

            if size == 0 {
                // Trailers end with an empty line
                while !self.read_line().await?.is_empty() {}
                return Ok(body.freeze());
            }

            let total = body
                .len()
                .checked_add(size)
                .ok_or_else(|| FrontError::Malformed(format!("chunk size {:?} overflows", size_text)))?;
            self.check_body_size(total)?;

            let chunk = self.read_exact(size + 2).await?;
            if &chunk[size..] != b"\r\n" {
                return Err(FrontError::Malformed("chunk not terminated by CRLF".into()));
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    async fn read_to_end(&mut self) -> Result<Bytes, FrontError> {
        loop {
            match self.fill().await {
                Ok(()) => {}
                Err(FrontError::ConnectionClosed) => break,
                Err(e) => return Err(e),
            }
            self.check_body_size(self.buf.len())?;
        }
        Ok(self.buf.split().freeze())
    }

    /// Returns the response and whether the connection can be reused
    async fn exchange(&mut self, host: &str, req: &HttpRequest) -> Result<(HttpResponse, bool), FrontError> {
        self.write_request(host, req).await?;
        let (status, headers) = self.read_head().await?;

        let find = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim().to_ascii_lowercase())
        };
        let mut keep_alive = find("connection").as_deref() != Some("close");

        let body = if req.method == Method::HEAD || status == 204 || status == 304 {
            Bytes::new()
        } else if find("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
            self.read_chunked().await?
        } else if let Some(len) = find("content-length") {
            let len: usize = len
                .parse()
                .map_err(|_| FrontError::Malformed(format!("bad content-length {:?}", len)))?;
            self.check_body_size(len)?;
            self.read_exact(len).await?
        } else {
            keep_alive = false;
            self.read_to_end().await?
        };

        Ok((HttpResponse { status, headers, body }, keep_alive))
    }
}

/// HTTP/1.1 connection
pub struct Http1Worker {
    info: ConnectionInfo,
    io: Mutex<Http1Io>,
    state: WorkerState,
}

impl Http1Worker {
    pub fn new(stream: BoxedStream, info: ConnectionInfo) -> Self {
        Self {
            info,
            io: Mutex::new(Http1Io {
                stream,
                buf: BytesMut::with_capacity(16 * 1024),
                max_body: MAX_BODY_SIZE,
            }),
            state: WorkerState::new(),
        }
    }

    /// Reject responses whose body would exceed `limit` bytes
    pub fn with_max_body(mut self, limit: usize) -> Self {
        self.io.get_mut().max_body = limit;
        self
    }
}

#[async_trait]
impl FrontConnection for Http1Worker {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, FrontError> {
        if self.state.is_closed() {
            return Err(FrontError::ConnectionClosed);
        }
        let mut io = self.io.try_lock().map_err(|_| FrontError::Busy)?;
        let guard = self.state.begin(true);

        let started = Instant::now();
        let result = tokio::time::timeout(req.timeout, io.exchange(&self.info.identity.host, &req)).await;

        match result {
            Ok(Ok((response, keep_alive))) => {
                trace!(
                    "{} {} -> {} ({} bytes, {:?})",
                    req.method,
                    req.path,
                    response.status,
                    response.body.len(),
                    started.elapsed()
                );
                guard.finish();
                if !keep_alive {
                    self.close();
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                debug!("HTTP/1.1 exchange on {} failed: {}", self.info.peer_label(), e);
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
        !self.state.is_closed() && self.state.in_flight() == 0
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
