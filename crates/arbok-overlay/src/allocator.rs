//! Overlay IP allocation
//!
//! Tracks allocated addresses within the configured CIDR. The first host
//! address (`network + 1`) belongs to the server and is never handed out.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{OverlayError, Result};

/// IP pool for overlay client addresses.
#[derive(Debug, Clone)]
pub struct IpPool {
    network: Ipv4Net,
    server_ip: Ipv4Addr,
    allocated: HashSet<Ipv4Addr>,
}

impl IpPool {
    /// Create a pool from CIDR notation (e.g. `10.100.0.0/24`).
    ///
    /// Fails on malformed CIDRs and on prefixes narrower than /30, which
    /// cannot hold the server address plus a client.
    pub fn new(cidr: &str) -> Result<Self> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| OverlayError::InvalidCidr(format!("{cidr}: {e}")))?;

        if network.prefix_len() > 30 {
            return Err(OverlayError::CidrTooSmall(cidr.to_string()));
        }

        let server_ip = network
            .hosts()
            .next()
            .ok_or_else(|| OverlayError::CidrTooSmall(cidr.to_string()))?;

        Ok(Self {
            network,
            server_ip,
            allocated: HashSet::new(),
        })
    }

    /// Allocate the lowest unused client address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        for ip in self.network.hosts() {
            if ip == self.server_ip || self.allocated.contains(&ip) {
                continue;
            }
            self.allocated.insert(ip);
            return Ok(ip);
        }
        Err(OverlayError::PoolExhausted)
    }

    /// Return an address to the pool.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<()> {
        if self.allocated.remove(&ip) {
            Ok(())
        } else {
            Err(OverlayError::NotAllocated(ip))
        }
    }

    /// Number of client addresses still available.
    pub fn available(&self) -> usize {
        let usable = self.network.hosts().count().saturating_sub(1);
        usable.saturating_sub(self.allocated.len())
    }

    /// Number of allocated client addresses.
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// The reserved server address (`network + 1`).
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Whether an address lies within the pool's CIDR.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    /// The pool's CIDR string.
    pub fn cidr(&self) -> String {
        self.network.to_string()
    }
}

/// The server overlay address for a CIDR without building a pool.
pub fn server_ip_for_cidr(cidr: &str) -> Result<Ipv4Addr> {
    Ok(IpPool::new(cidr)?.server_ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_server_address() {
        let mut pool = IpPool::new("10.100.0.0/24").unwrap();
        assert_eq!(pool.server_ip().to_string(), "10.100.0.1");
        assert_eq!(pool.allocate().unwrap().to_string(), "10.100.0.2");
    }

    #[test]
    fn allocation_is_deterministic_lowest_first() {
        let mut pool = IpPool::new("10.100.0.0/24").unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(
            vec![a.to_string(), b.to_string(), c.to_string()],
            vec!["10.100.0.2", "10.100.0.3", "10.100.0.4"]
        );

        pool.release(b).unwrap();
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn slash_30_has_one_client_ip() {
        let mut pool = IpPool::new("10.100.0.0/30").unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate().unwrap().to_string(), "10.100.0.2");
        assert!(matches!(pool.allocate(), Err(OverlayError::PoolExhausted)));
    }

    #[test]
    fn narrow_cidrs_fail_to_construct() {
        assert!(matches!(
            IpPool::new("10.100.0.0/31"),
            Err(OverlayError::CidrTooSmall(_))
        ));
        assert!(matches!(
            IpPool::new("10.100.0.1/32"),
            Err(OverlayError::CidrTooSmall(_))
        ));
        assert!(matches!(
            IpPool::new("not-a-cidr"),
            Err(OverlayError::InvalidCidr(_))
        ));
    }

    #[test]
    fn release_unallocated_fails() {
        let mut pool = IpPool::new("10.100.0.0/24").unwrap();
        let err = pool.release("10.100.0.50".parse().unwrap());
        assert!(matches!(err, Err(OverlayError::NotAllocated(_))));
    }

    #[test]
    fn available_tracks_allocations() {
        let mut pool = IpPool::new("10.100.0.0/29").unwrap();
        // /29: 6 hosts, minus the server
        assert_eq!(pool.available(), 5);
        let ip = pool.allocate().unwrap();
        assert_eq!(pool.available(), 4);
        pool.release(ip).unwrap();
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn server_ip_helper() {
        assert_eq!(
            server_ip_for_cidr("10.100.0.0/24").unwrap().to_string(),
            "10.100.0.1"
        );
        assert!(server_ip_for_cidr("10.0.0.0/32").is_err());
    }
}
