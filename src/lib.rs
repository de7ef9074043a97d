//! # xtunnel
//!
//! Client for a reliable tunnel carried over disguised HTTP(S) fronts.
//!
//! ## Features
//!
//! - **IP pools** scored by handshake latency, refilled from range lists
//! - **Front identities**: generated SNI, rotating app ids, fronted Host
//! - **HTTP/1.1 and HTTP/2 workers** over rustls with browser-like hellos
//! - **Reliable session**: sequenced blocks, acks, resend, flow control
//! - **Stream multiplexing** of many TCP connections over one session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Session Manager                     │
//! │         (login, re-login, stream open/close)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │   (blocks, send window, reorder, streams, workers)   │
//! ├─────────────────────────────────────────────────────┤
//! │                  Protocol Layer                      │
//! │        (x-tunnel packs, optional body sealing)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Front Layer                       │
//! │   (connect creator, HTTP/1.1 + HTTP/2 workers)       │
//! ├─────────────────────────────────────────────────────┤
//! │             IP Pool / Prober / Identity              │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                (TCP, TLS provider)                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod front;
pub mod identity;
pub mod ip;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Client version, reported at login
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("IP pool error: {0}")]
    Ip(#[from] ip::IpError),

    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("Front error: {0}")]
    Front(#[from] front::FrontError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
