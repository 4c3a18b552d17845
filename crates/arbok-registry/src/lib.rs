//! Arbok registry — the authoritative table of live tunnels.
//!
//! Coordinates the address pool, key factory, name factory, and the
//! tunnel device so that every live record has exactly one overlay IP and
//! one peer-table entry, and enforces TTL expiry through a background
//! reaper.

pub mod error;
pub mod names;
pub mod registry;
pub mod tunnel;

pub use error::RegistryError;
pub use registry::{Registry, RegistryConfig};
pub use tunnel::Tunnel;
