//! Tunnel layer - reliable session over request/response fronts
//!
//! Provides:
//! - Blocks, segmentation and the send window
//! - In-order reassembly
//! - Stream records and per-stream flow control
//! - The session workers and the session manager

mod block;
mod frame;
mod manager;
mod multiplexer;
mod recv;
mod session;
mod stream;
mod window;

pub use block::{segment, Segmenter, TunnelBlock};
pub use frame::{Frame, FrameBody, FrameType, COMMAND_HEADER_SIZE, FRAME_HEADER_SIZE};
pub use manager::{build_codec, SessionManager};
pub use multiplexer::{FrameOutcome, Multiplexer, StreamEvent, MAX_STREAMS};
pub use recv::RecvBuffer;
pub use session::{SessionSettings, SessionState, StreamHandle, TunnelSession, TunnelStats};
pub use stream::{StreamState, TunnelStream};
pub use window::SendWindow;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Too many streams (max {0})")]
    TooManyStreams(usize),

    #[error("Send window full")]
    WindowFull,

    #[error("Receive buffer full")]
    RecvOverflow,

    #[error("Ack for unsent block {sequence} (next {next})")]
    AckOutOfRange { sequence: u64, next: u64 },

    #[error("Block {0} reached the retry limit")]
    RetryExhausted(u64),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Unexpected HTTP status {0}")]
    BadStatus(u16),

    #[error("Server is down")]
    ServerDown,

    #[error("Out of quota")]
    NoQuota,

    #[error("Session does not exist on the server")]
    SessionNotExist,

    #[error("No roundtrip succeeded for {0:?}")]
    Silence(std::time::Duration),

    #[error("No front available")]
    NoFront,

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Front error: {0}")]
    Front(#[from] crate::front::FrontError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl TunnelError {
    /// Errors after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::AckOutOfRange { .. }
                | TunnelError::RetryExhausted(_)
                | TunnelError::LoginFailed(_)
                | TunnelError::ServerDown
                | TunnelError::NoQuota
                | TunnelError::SessionNotExist
                | TunnelError::Silence(_)
                | TunnelError::InvalidFrame(_)
                | TunnelError::SessionClosed(_)
        )
    }
}
