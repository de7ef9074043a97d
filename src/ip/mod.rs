//! IP selection
//!
//! - [`IpRangeSet`]: static address sources (CIDR, hyphen ranges, prefixes)
//! - [`IpPool`]: scored working set per front
//! - [`Prober`]: one-shot health check of an address
//! - [`IpScanner`]: background top-up of the pool while it runs low

mod pool;
mod prober;
mod range;
mod scanner;

pub use pool::{IpPool, IpRecord, PoolConfig, PoolState};
pub use prober::{ProbeError, ProbeResult, Prober, ProberConfig};
pub use range::{IpRange, IpRangeSet};
pub use scanner::{IpScanner, ScannerConfig};

use std::net::IpAddr;
use thiserror::Error;

/// IP pool errors
#[derive(Debug, Error)]
pub enum IpError {
    #[error("IP {0} is not in the pool")]
    NotFound(IpAddr),

    #[error("IP {0} was already removed")]
    AlreadyRemoved(IpAddr),

    #[error("IP pool {0} exhausted")]
    PoolExhausted(String),

    #[error("Invalid IP range: {0}")]
    InvalidRange(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
