//! Registry integration tests against a real (loopback, idle) device.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arbok_overlay::{DeviceConfig, TunnelDevice};
use arbok_registry::{Registry, RegistryConfig, RegistryError};

async fn device_for(cidr: &str) -> Arc<TunnelDevice> {
    let (private_key, _) = arbok_overlay::keys::generate_keypair();
    let server_ip = arbok_overlay::server_ip_for_cidr(cidr).unwrap();
    let cfg = DeviceConfig::new(private_key, 0, server_ip);
    Arc::new(TunnelDevice::new(cfg).await.unwrap())
}

fn registry_cfg(cidr: &str, ttl: Duration, cleanup: Duration) -> RegistryConfig {
    RegistryConfig {
        cidr: cidr.to_string(),
        default_ttl: ttl,
        cleanup_interval: cleanup,
    }
}

#[tokio::test]
async fn create_assigns_distinct_resources_and_peers() {
    let device = device_for("10.100.0.0/28").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/28", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let a = registry.create(3000).await.unwrap();
    let b = registry.create(3001).await.unwrap();
    let c = registry.create(3002).await.unwrap();

    let ips: HashSet<_> = [a.allowed_ip, b.allowed_ip, c.allowed_ip].into_iter().collect();
    assert_eq!(ips.len(), 3);
    assert!(!ips.contains(&"10.100.0.1".parse().unwrap()));

    let subs: HashSet<_> = [&a.subdomain, &b.subdomain, &c.subdomain]
        .into_iter()
        .collect();
    assert_eq!(subs.len(), 3);

    // every record has exactly one peer entry pinned to its IP
    let stats = device.peer_stats().await;
    assert_eq!(stats.len(), 3);
    for t in [&a, &b, &c] {
        let peer = stats
            .iter()
            .find(|p| p.public_key == t.public_key)
            .expect("peer installed");
        assert_eq!(peer.allowed_ip, t.allowed_ip);
    }

    // the creation response is the only place the private key appears
    assert!(!a.private_key.is_empty());

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn exhaustion_fails_cleanly() {
    let device = device_for("10.100.0.0/30").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/30", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let first = registry.create(3000).await.unwrap();
    assert_eq!(first.allowed_ip.to_string(), "10.100.0.2");

    let err = registry.create(3000).await.unwrap_err();
    assert!(matches!(err, RegistryError::PoolExhausted));
    // the failed create left nothing behind
    assert_eq!(registry.active_count(), 1);
    assert_eq!(device.peer_stats().await.len(), 1);

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn create_delete_returns_pool_to_prior_state() {
    let device = device_for("10.100.0.0/29").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/29", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let before = registry.available_ips();
    let t = registry.create(8080).await.unwrap();
    assert_eq!(registry.available_ips(), before - 1);

    registry.delete(&t.id).await.unwrap();
    assert_eq!(registry.available_ips(), before);
    assert!(registry.get(&t.id).is_none());
    assert!(registry.get_by_subdomain(&t.subdomain).is_none());
    assert!(device.peer_stats().await.is_empty());

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn delete_unknown_id_is_not_found() {
    let device = device_for("10.100.0.0/29").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/29", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let err = registry.delete("no-such-id").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn concurrent_creates_within_capacity_all_succeed() {
    let device = device_for("10.100.0.0/27").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/27", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let mut handles = Vec::new();
    for i in 0..10u16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.create(3000 + i).await }));
    }

    let mut ips = HashSet::new();
    let mut subdomains = HashSet::new();
    for handle in handles {
        let t = handle.await.unwrap().unwrap();
        assert!(ips.insert(t.allowed_ip));
        assert!(subdomains.insert(t.subdomain));
    }

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn concurrent_creates_beyond_capacity_fail_with_exhaustion() {
    // /30 holds exactly one client address
    let device = device_for("10.100.0.0/30").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/30", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.create(3000).await }));
    }

    let mut successes = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(RegistryError::PoolExhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(exhausted, 3);

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn reaper_removes_expired_records() {
    let device = device_for("10.100.0.0/29").await;
    let registry = Registry::new(
        registry_cfg(
            "10.100.0.0/29",
            Duration::from_secs(1),
            Duration::from_millis(500),
        ),
        device.clone(),
    )
    .unwrap();

    let before = registry.available_ips();
    let t = registry.create(3000).await.unwrap();
    assert!(registry.get(&t.id).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(registry.get(&t.id).is_none(), "reaper removed the record");
    assert_eq!(registry.available_ips(), before);
    assert!(device.peer_stats().await.is_empty());

    registry.close().await;
    device.close().await;
}

#[tokio::test]
async fn close_drains_everything() {
    let device = device_for("10.100.0.0/28").await;
    let registry = Registry::new(
        registry_cfg("10.100.0.0/28", Duration::from_secs(3600), Duration::from_secs(60)),
        device.clone(),
    )
    .unwrap();

    registry.create(3000).await.unwrap();
    registry.create(3001).await.unwrap();

    registry.close().await;
    assert_eq!(registry.active_count(), 0);
    assert!(device.peer_stats().await.is_empty());

    device.close().await;
}
