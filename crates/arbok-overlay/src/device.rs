//! The process-wide tunnel device.
//!
//! [`TunnelDevice`] is a handle over a single data-plane task (see
//! [`crate::dataplane`]) that owns the encrypted UDP endpoint, the peer
//! table, and the userspace TCP/IP stack. All public methods go through a
//! command channel, so none of them ever block on packet I/O.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dataplane::{self, Dataplane};
use crate::error::{OverlayError, Result};
use crate::keys;
use crate::stream::{pump, ByteQueue, OverlayStream, VirtualConnQueues};

/// Default interface MTU, matching the WireGuard convention.
pub const DEFAULT_MTU: usize = 1420;

/// Persistent keepalive installed for every peer, in seconds.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_CHANNEL_CAP: usize = 256;
const CONN_QUEUE_CAP: usize = 256;
const PIPE_BUF: usize = 64 * 1024;

/// Tunnel device configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Server private key, base64 (32 bytes)
    pub private_key: String,
    /// Encrypted UDP listen port (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Server overlay address, `network + 1` of the configured CIDR
    pub server_ip: Ipv4Addr,
    /// Virtual interface MTU
    pub mtu: usize,
    /// Resolvers handed to the userspace stack. Dial targets are always
    /// overlay IPs, so these are informational.
    pub dns_servers: Vec<IpAddr>,
}

impl DeviceConfig {
    pub fn new(private_key: impl Into<String>, listen_port: u16, server_ip: Ipv4Addr) -> Self {
        Self {
            private_key: private_key.into(),
            listen_port,
            server_ip,
            mtu: DEFAULT_MTU,
            dns_servers: Vec::new(),
        }
    }
}

/// Point-in-time view of one peer table entry.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub public_key: String,
    pub allowed_ip: Ipv4Addr,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<Duration>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Commands accepted by the data-plane task.
pub(crate) enum Command {
    AddPeer {
        public_key: [u8; 32],
        allowed_ip: Ipv4Addr,
        done: oneshot::Sender<std::result::Result<(), String>>,
    },
    RemovePeer {
        public_key: [u8; 32],
        done: oneshot::Sender<bool>,
    },
    Connect {
        ip: Ipv4Addr,
        port: u16,
        queues: VirtualConnQueues,
        connected: oneshot::Sender<std::result::Result<(), String>>,
    },
    PeerStats {
        reply: oneshot::Sender<Vec<PeerStats>>,
    },
}

/// One userspace WireGuard device shared by every tunnel.
pub struct TunnelDevice {
    public_key: String,
    server_ip: Ipv4Addr,
    listen_port: u16,
    cmd_tx: mpsc::Sender<Command>,
    loop_notify: Arc<Notify>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelDevice {
    /// Bind the UDP endpoint and start the data-plane task.
    pub async fn new(cfg: DeviceConfig) -> Result<Self> {
        let secret_bytes = keys::decode_key(&cfg.private_key)?;
        let public_key = keys::derive_public(&cfg.private_key)?;

        let udp = UdpSocket::bind(("0.0.0.0", cfg.listen_port)).await?;
        let listen_port = udp.local_addr()?.port();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAP);
        let loop_notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let plane = Dataplane::new(secret_bytes, cfg.server_ip, cfg.mtu, udp);
        let task = tokio::spawn(dataplane::run(
            plane,
            cmd_rx,
            loop_notify.clone(),
            cancel.clone(),
        ));

        info!(
            listen_port,
            server_ip = %cfg.server_ip,
            mtu = cfg.mtu,
            dns = ?cfg.dns_servers,
            "tunnel device started"
        );

        Ok(Self {
            public_key,
            server_ip: cfg.server_ip,
            listen_port,
            cmd_tx,
            loop_notify,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Insert or update a peer. Re-adding a key replaces its allowed IP in
    /// place; the keepalive is pinned to 25 s.
    pub async fn add_peer(&self, public_key_b64: &str, allowed_ip: Ipv4Addr) -> Result<()> {
        let public_key = keys::decode_key(public_key_b64)?;
        let (done, done_rx) = oneshot::channel();
        self.send(Command::AddPeer {
            public_key,
            allowed_ip,
            done,
        })
        .await?;
        done_rx
            .await
            .map_err(|_| OverlayError::DeviceClosed)?
            .map_err(OverlayError::InvalidKey)?;
        debug!(peer = %truncate_key(public_key_b64), ip = %allowed_ip, "peer added");
        Ok(())
    }

    /// Remove a peer. No-op if the key is absent.
    pub async fn remove_peer(&self, public_key_b64: &str) -> Result<()> {
        let public_key = keys::decode_key(public_key_b64)?;
        let (done, done_rx) = oneshot::channel();
        self.send(Command::RemovePeer { public_key, done }).await?;
        let removed = done_rx.await.map_err(|_| OverlayError::DeviceClosed)?;
        debug!(peer = %truncate_key(public_key_b64), removed, "peer removed");
        Ok(())
    }

    /// Open a TCP connection over the overlay, originating from the
    /// server's overlay address. Honors a 10 s dial deadline covering both
    /// the WireGuard handshake and the TCP handshake.
    pub async fn dial_tcp(&self, ip: Ipv4Addr, port: u16) -> Result<OverlayStream> {
        let to_remote = Arc::new(ByteQueue::new(CONN_QUEUE_CAP, self.loop_notify.clone()));
        let from_remote = Arc::new(ByteQueue::new(CONN_QUEUE_CAP, self.loop_notify.clone()));
        let (connected, connected_rx) = oneshot::channel();

        self.send(Command::Connect {
            ip,
            port,
            queues: VirtualConnQueues {
                to_remote: to_remote.clone(),
                from_remote: from_remote.clone(),
            },
            connected,
        })
        .await?;

        let outcome = tokio::time::timeout(DIAL_TIMEOUT, connected_rx).await;
        match outcome {
            Err(_) => {
                to_remote.close();
                from_remote.close();
                Err(OverlayError::DialTimeout { ip, port })
            }
            Ok(Err(_)) => Err(OverlayError::DeviceClosed),
            Ok(Ok(Err(reason))) => Err(OverlayError::DialFailed { ip, port, reason }),
            Ok(Ok(Ok(()))) => {
                let (user, pipe) = tokio::io::duplex(PIPE_BUF);
                tokio::spawn(pump(pipe, to_remote, from_remote));
                Ok(OverlayStream::new(user))
            }
        }
    }

    /// Snapshot of the peer table.
    pub async fn peer_stats(&self) -> Vec<PeerStats> {
        let (reply, reply_rx) = oneshot::channel();
        if self.send(Command::PeerStats { reply }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// The server's derived public key, base64.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The server overlay address.
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// The bound encrypted UDP port.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Tear the device down: stop the data plane, clear the peer table,
    /// release the socket. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.loop_notify.notify_waiters();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
            info!("tunnel device closed");
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| OverlayError::DeviceClosed)
    }
}

fn truncate_key(key: &str) -> &str {
    if key.len() <= 8 {
        key
    } else {
        &key[..8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    async fn test_device() -> TunnelDevice {
        let (private_key, _) = generate_keypair();
        let cfg = DeviceConfig::new(private_key, 0, "10.100.0.1".parse().unwrap());
        TunnelDevice::new(cfg).await.unwrap()
    }

    #[tokio::test]
    async fn starts_and_closes_idempotently() {
        let device = test_device().await;
        assert_eq!(device.public_key().len(), 44);
        assert!(device.listen_port() > 0);
        device.close().await;
        device.close().await;
    }

    #[tokio::test]
    async fn add_remove_readd_leaves_one_peer() {
        let device = test_device().await;
        let (_, peer_pub) = generate_keypair();
        let ip_a: Ipv4Addr = "10.100.0.2".parse().unwrap();
        let ip_b: Ipv4Addr = "10.100.0.3".parse().unwrap();

        device.add_peer(&peer_pub, ip_a).await.unwrap();
        device.remove_peer(&peer_pub).await.unwrap();
        device.add_peer(&peer_pub, ip_b).await.unwrap();

        let stats = device.peer_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].allowed_ip, ip_b);
        assert_eq!(stats[0].public_key, peer_pub);
        device.close().await;
    }

    #[tokio::test]
    async fn readd_updates_allowed_ip_in_place() {
        let device = test_device().await;
        let (_, peer_pub) = generate_keypair();

        device
            .add_peer(&peer_pub, "10.100.0.2".parse().unwrap())
            .await
            .unwrap();
        device
            .add_peer(&peer_pub, "10.100.0.9".parse().unwrap())
            .await
            .unwrap();

        let stats = device.peer_stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].allowed_ip.to_string(), "10.100.0.9");
        device.close().await;
    }

    #[tokio::test]
    async fn remove_absent_peer_is_noop() {
        let device = test_device().await;
        let (_, peer_pub) = generate_keypair();
        device.remove_peer(&peer_pub).await.unwrap();
        device.close().await;
    }

    #[tokio::test]
    async fn dial_without_peer_fails_fast() {
        let device = test_device().await;
        let err = device
            .dial_tcp("10.100.0.50".parse().unwrap(), 80)
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::DialFailed { .. }));
        device.close().await;
    }

    #[tokio::test]
    async fn calls_after_close_report_device_closed() {
        let device = test_device().await;
        let (_, peer_pub) = generate_keypair();
        device.close().await;
        let err = device
            .add_peer(&peer_pub, "10.100.0.2".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::DeviceClosed));
    }
}
