//! Protocol definitions and constants
//!
//! The x-tunnel wire format: a login exchange creates the session, then
//! every roundtrip POSTs blocks + acks and gets blocks + acks back. The
//! framing sits behind [`BlockCodec`] so a front can swap it out.

mod codec;

pub use codec::{
    AckInfo, BlockCodec, EncryptedCodec, LoginRequest, LoginResponse, RoundtripData,
    RoundtripRequest, RoundtripResponse, TransferReport, XTunnelCodec,
};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Invalid pack type: {0}")]
    InvalidPackType(u8),

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Length mismatch: {0}")]
    LengthMismatch(String),

    #[error("{0} too large: {1}")]
    FieldTooLarge(&'static str, usize),

    #[error("Checksum mismatch")]
    Checksum,

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Damage in transit rather than a peer speaking the wrong protocol
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Checksum | ProtocolError::Crypto(_))
    }
}

/// First byte of every pack
pub const MAGIC: u8 = b'P';

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 2;

pub const PACK_LOGIN: u8 = 1;
pub const PACK_ROUNDTRIP: u8 = 2;
pub const PACK_ERROR: u8 = 3;

/// Session id length in bytes
pub const SESSION_ID_LEN: usize = 8;

/// HTTP status the server uses when it is going away
pub const HTTP_SERVER_DOWN: u16 = 521;

/// Trailing hex md5 on roundtrip responses
pub const CHECKSUM_LEN: usize = 32;

/// Error codes carried in pack type 3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    NoQuota,
    Unpack,
    SessionNotExist,
    Other(u8),
}

impl From<u8> for ServerErrorCode {
    fn from(code: u8) -> Self {
        match code {
            1 => ServerErrorCode::NoQuota,
            2 => ServerErrorCode::Unpack,
            3 => ServerErrorCode::SessionNotExist,
            other => ServerErrorCode::Other(other),
        }
    }
}

impl From<ServerErrorCode> for u8 {
    fn from(code: ServerErrorCode) -> Self {
        match code {
            ServerErrorCode::NoQuota => 1,
            ServerErrorCode::Unpack => 2,
            ServerErrorCode::SessionNotExist => 3,
            ServerErrorCode::Other(c) => c,
        }
    }
}
