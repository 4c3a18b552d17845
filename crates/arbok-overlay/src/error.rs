//! Error types for overlay operations

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur in the overlay data plane and its factories.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Invalid CIDR notation
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// CIDR too narrow to hold the server plus at least one client
    #[error("CIDR {0} is narrower than /30")]
    CidrTooSmall(String),

    /// No available IPs in the configured CIDR range
    #[error("IP pool exhausted")]
    PoolExhausted,

    /// Releasing an IP that was never allocated
    #[error("IP {0} was not allocated")]
    NotAllocated(Ipv4Addr),

    /// Key material failed to decode or had the wrong length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The device task is gone (closed or crashed)
    #[error("tunnel device is closed")]
    DeviceClosed,

    /// Overlay dial did not complete within the deadline
    #[error("dial {ip}:{port} timed out")]
    DialTimeout { ip: Ipv4Addr, port: u16 },

    /// Overlay dial was refused or the target has no peer
    #[error("dial {ip}:{port} failed: {reason}")]
    DialFailed {
        ip: Ipv4Addr,
        port: u16,
        reason: String,
    },

    /// Socket-level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OverlayError>;
