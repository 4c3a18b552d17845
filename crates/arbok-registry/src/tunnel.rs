//! Tunnel record model.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A live tunnel record, owned exclusively by the registry.
///
/// Immutable fields are set at creation; the traffic counters and
/// last-seen timestamp are atomics so read paths can touch them under the
/// registry's shared lock.
#[derive(Debug)]
pub struct TunnelEntry {
    pub id: String,
    pub subdomain: String,
    pub port: u16,
    pub public_key: String,
    pub private_key: String,
    pub allowed_ip: Ipv4Addr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    last_seen_unix: AtomicI64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TunnelEntry {
    pub fn new(
        id: String,
        subdomain: String,
        port: u16,
        public_key: String,
        private_key: String,
        allowed_ip: Ipv4Addr,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subdomain,
            port,
            public_key,
            private_key,
            allowed_ip,
            created_at,
            expires_at,
            last_seen_unix: AtomicI64::new(created_at.timestamp()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Record that the tunnel was looked up or carried traffic.
    pub fn touch(&self) {
        self.last_seen_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn add_traffic(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// A point-in-time copy for callers outside the registry lock.
    pub fn snapshot(&self) -> Tunnel {
        let last_seen = Utc
            .timestamp_opt(self.last_seen_unix.load(Ordering::Relaxed), 0)
            .single()
            .unwrap_or(self.created_at);
        Tunnel {
            id: self.id.clone(),
            subdomain: self.subdomain.clone(),
            port: self.port,
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            allowed_ip: self.allowed_ip,
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_seen_at: last_seen,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of a tunnel record.
///
/// The private key rides along so the provisioning handler can render the
/// client config, but it is never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct Tunnel {
    pub id: String,
    pub subdomain: String,
    pub port: u16,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub allowed_ip: Ipv4Addr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Tunnel {
    /// Remaining lifetime; zero once expired.
    pub fn ttl(&self) -> std::time::Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(ttl_secs: i64) -> TunnelEntry {
        let now = Utc::now();
        TunnelEntry::new(
            "id-1".into(),
            "happy-cloud-0001".into(),
            3000,
            "pub".into(),
            "priv".into(),
            "10.100.0.2".parse().unwrap(),
            now,
            now + Duration::seconds(ttl_secs),
        )
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let e = entry(60);
        assert!(!e.is_expired(Utc::now()));
        assert!(e.is_expired(e.expires_at));
        assert!(e.is_expired(e.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn snapshot_never_serializes_private_key() {
        let snap = entry(60).snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("private_key").is_none());
        assert_eq!(json["subdomain"], "happy-cloud-0001");
        // the in-memory view still carries it for config rendering
        assert_eq!(snap.private_key, "priv");
    }

    #[test]
    fn traffic_counters_accumulate() {
        let e = entry(60);
        e.add_traffic(100, 50);
        e.add_traffic(1, 2);
        let snap = e.snapshot();
        assert_eq!(snap.bytes_in, 101);
        assert_eq!(snap.bytes_out, 52);
    }
}
