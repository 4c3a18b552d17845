//! The registry proper: two indexes, the address pool, and the reaper.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use arbok_observability::metrics;
use arbok_overlay::{IpPool, OverlayError, TunnelDevice};

use crate::error::{RegistryError, Result};
use crate::names;
use crate::tunnel::{Tunnel, TunnelEntry};

/// Attempts at a unique subdomain before a create aborts.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Overlay network CIDR (mirrors the device's)
    pub cidr: String,
    /// Record lifetime at creation
    pub default_ttl: Duration,
    /// Reaper period
    pub cleanup_interval: Duration,
}

struct Inner {
    by_id: HashMap<String, Arc<TunnelEntry>>,
    by_subdomain: HashMap<String, Arc<TunnelEntry>>,
    pool: IpPool,
}

impl Inner {
    fn sync_gauges(&self) {
        metrics().tunnels_active.set(self.by_id.len() as i64);
        metrics().ip_pool_available.set(self.pool.available() as i64);
    }
}

/// Authoritative table of live tunnels.
pub struct Registry {
    cfg: RegistryConfig,
    device: Arc<TunnelDevice>,
    inner: RwLock<Inner>,
    cancel: CancellationToken,
    reaper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    /// Build the registry and start the reaper.
    pub fn new(cfg: RegistryConfig, device: Arc<TunnelDevice>) -> Result<Arc<Self>> {
        let pool = IpPool::new(&cfg.cidr)?;

        let registry = Arc::new(Self {
            cfg,
            device,
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_subdomain: HashMap::new(),
                pool,
            }),
            cancel: CancellationToken::new(),
            reaper: tokio::sync::Mutex::new(None),
        });

        registry.inner.read().sync_gauges();

        let weak = Arc::downgrade(&registry);
        let cancel = registry.cancel.clone();
        let interval = registry.cfg.cleanup_interval;
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.reap_expired().await;
            }
        });
        *registry.reaper.try_lock().expect("fresh registry") = Some(reaper);

        Ok(registry)
    }

    /// Create a tunnel for the given client port.
    ///
    /// Allocation, key generation, naming, and index insertion happen
    /// under the write lock; the device peer install happens after, with
    /// full rollback if it fails. The returned snapshot carries the
    /// private key — its only trip out of the registry.
    pub async fn create(&self, port: u16) -> Result<Tunnel> {
        let entry = {
            let mut inner = self.inner.write();

            let ip = match inner.pool.allocate() {
                Ok(ip) => ip,
                Err(OverlayError::PoolExhausted) => {
                    metrics().ip_pool_exhausted_total.inc();
                    return Err(RegistryError::PoolExhausted);
                }
                Err(e) => return Err(e.into()),
            };

            let (private_key, public_key) = arbok_overlay::keys::generate_keypair();

            let mut subdomain = None;
            for _ in 0..MAX_NAME_ATTEMPTS {
                let candidate = names::generate();
                if !inner.by_subdomain.contains_key(&candidate) {
                    subdomain = Some(candidate);
                    break;
                }
            }
            let Some(subdomain) = subdomain else {
                if let Err(e) = inner.pool.release(ip) {
                    error!(error = %e, ip = %ip, "failed to release IP during rollback");
                }
                return Err(RegistryError::NameCollision(MAX_NAME_ATTEMPTS));
            };

            let now = Utc::now();
            let ttl = ChronoDuration::from_std(self.cfg.default_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(24));
            let entry = Arc::new(TunnelEntry::new(
                Uuid::new_v4().to_string(),
                subdomain,
                port,
                public_key,
                private_key,
                ip,
                now,
                now + ttl,
            ));

            inner.by_id.insert(entry.id.clone(), entry.clone());
            inner
                .by_subdomain
                .insert(entry.subdomain.clone(), entry.clone());
            inner.sync_gauges();
            entry
        };

        if let Err(e) = self
            .device
            .add_peer(&entry.public_key, entry.allowed_ip)
            .await
        {
            let mut inner = self.inner.write();
            inner.by_id.remove(&entry.id);
            inner.by_subdomain.remove(&entry.subdomain);
            if let Err(release_err) = inner.pool.release(entry.allowed_ip) {
                error!(error = %release_err, "failed to release IP during rollback");
            }
            inner.sync_gauges();
            metrics().wireguard_errors_total.inc();
            return Err(e.into());
        }

        metrics().tunnels_created_total.inc();
        info!(
            id = %entry.id,
            subdomain = %entry.subdomain,
            ip = %entry.allowed_ip,
            port = entry.port,
            ttl = ?self.cfg.default_ttl,
            "tunnel created"
        );

        Ok(entry.snapshot())
    }

    /// Look a tunnel up by id, refreshing its last-seen timestamp.
    pub fn get(&self, id: &str) -> Option<Tunnel> {
        let inner = self.inner.read();
        let entry = inner.by_id.get(id)?;
        entry.touch();
        Some(entry.snapshot())
    }

    /// Look a tunnel up by subdomain, refreshing its last-seen timestamp.
    pub fn get_by_subdomain(&self, subdomain: &str) -> Option<Tunnel> {
        let inner = self.inner.read();
        let entry = inner.by_subdomain.get(subdomain)?;
        entry.touch();
        Some(entry.snapshot())
    }

    /// Delete a tunnel. Index removal is authoritative; peer removal and
    /// IP release are best-effort and logged.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let entry = self.remove_from_indexes(id)?;
        metrics().tunnels_deleted_total.inc();
        self.teardown_peer(&entry).await;
        info!(id = %entry.id, subdomain = %entry.subdomain, "tunnel deleted");
        Ok(())
    }

    /// Snapshot every live tunnel.
    pub fn list(&self) -> Vec<Tunnel> {
        let inner = self.inner.read();
        inner.by_id.values().map(|e| e.snapshot()).collect()
    }

    /// Add proxied byte counts to a record.
    pub fn update_traffic(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        let inner = self.inner.read();
        if let Some(entry) = inner.by_id.get(id) {
            entry.add_traffic(bytes_in, bytes_out);
            entry.touch();
            metrics()
                .http_bytes_proxied_total
                .inc_by(bytes_in + bytes_out);
        }
    }

    /// Number of live tunnels.
    pub fn active_count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Free addresses in the pool.
    pub fn available_ips(&self) -> usize {
        self.inner.read().pool.available()
    }

    /// Stop the reaper and tear down every live tunnel.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(reaper) = self.reaper.lock().await.take() {
            let _ = reaper.await;
        }

        let entries: Vec<Arc<TunnelEntry>> = {
            let mut inner = self.inner.write();
            let entries: Vec<_> = inner.by_id.values().cloned().collect();
            inner.by_id.clear();
            inner.by_subdomain.clear();
            for entry in &entries {
                if let Err(e) = inner.pool.release(entry.allowed_ip) {
                    error!(error = %e, ip = %entry.allowed_ip, "failed to release IP at shutdown");
                }
            }
            inner.sync_gauges();
            entries
        };

        for entry in &entries {
            metrics().tunnels_deleted_total.inc();
            self.teardown_peer(entry).await;
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "removed all tunnels at shutdown");
        }
    }

    /// Remove every record whose deadline has passed. Runs off the reaper
    /// ticker, but callable directly (tests drive it without waiting).
    pub async fn reap_expired(&self) {
        let now = Utc::now();
        let expired: Vec<Arc<TunnelEntry>> = {
            let mut inner = self.inner.write();
            let expired: Vec<_> = inner
                .by_id
                .values()
                .filter(|e| e.is_expired(now))
                .cloned()
                .collect();
            for entry in &expired {
                inner.by_id.remove(&entry.id);
                inner.by_subdomain.remove(&entry.subdomain);
                if let Err(e) = inner.pool.release(entry.allowed_ip) {
                    error!(error = %e, ip = %entry.allowed_ip, "failed to release expired IP");
                }
            }
            if !expired.is_empty() {
                inner.sync_gauges();
            }
            expired
        };

        for entry in &expired {
            metrics().tunnels_expired_total.inc();
            self.teardown_peer(entry).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "cleaned up expired tunnels");
        }
    }

    fn remove_from_indexes(&self, id: &str) -> Result<Arc<TunnelEntry>> {
        let mut inner = self.inner.write();
        let entry = inner
            .by_id
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        inner.by_subdomain.remove(&entry.subdomain);
        if let Err(e) = inner.pool.release(entry.allowed_ip) {
            error!(error = %e, ip = %entry.allowed_ip, "failed to release IP");
        }
        inner.sync_gauges();
        Ok(entry)
    }

    async fn teardown_peer(&self, entry: &TunnelEntry) {
        if let Err(e) = self.device.remove_peer(&entry.public_key).await {
            warn!(error = %e, id = %entry.id, "failed to remove peer");
            metrics().wireguard_errors_total.inc();
        }
    }
}
