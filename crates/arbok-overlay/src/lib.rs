//! Arbok overlay — the encrypted data plane.
//!
//! One process-wide userspace WireGuard device multiplexes every tunnel
//! client: a virtual interface whose I/O is an in-memory byte channel, a
//! smoltcp TCP/IP stack layered above it, and an encrypted UDP endpoint
//! applying a per-peer [`boringtun`] tunnel state. No TUN device, kernel
//! module, or elevated privileges are involved.
//!
//! The crate also carries the two small factories the control plane needs:
//! WireGuard keypair generation ([`keys`]) and overlay IP allocation
//! ([`allocator`]).

pub mod allocator;
mod dataplane;
pub mod device;
pub mod error;
pub mod keys;
mod stream;

pub use allocator::{server_ip_for_cidr, IpPool};
pub use device::{DeviceConfig, PeerStats, TunnelDevice, DEFAULT_MTU};
pub use error::{OverlayError, Result};
pub use stream::OverlayStream;
