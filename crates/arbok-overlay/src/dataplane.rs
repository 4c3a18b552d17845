//! The device's single data-plane task.
//!
//! One loop owns everything packet-shaped: the encrypted UDP socket, the
//! per-peer WireGuard state, the smoltcp interface over an in-memory
//! packet device, and the virtual TCP connections opened by `dial_tcp`.
//! The public [`crate::device::TunnelDevice`] talks to it exclusively
//! through the command channel, so peer table changes and dials serialize
//! with packet processing without any shared locks.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use boringtun::noise::errors::WireGuardError;
use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::rate_limiter::RateLimiter;
use boringtun::noise::{Packet, Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use bytes::Bytes;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketSet};
use smoltcp::phy::{DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use arbok_observability::metrics;

use crate::device::{Command, PeerStats, PERSISTENT_KEEPALIVE_SECS};
use crate::stream::VirtualConnQueues;

const UDP_BUF: usize = 65536;
const UDP_RECV_BURST: usize = 64;
const TCP_SOCKET_BUF: usize = 256 * 1024;
const RECV_CHUNK: usize = 16 * 1024;
const OUTBOUND_PENDING_MAX: usize = 1 << 20;
const LOCAL_PORT_START: u16 = 40000;
const LOCAL_PORT_END: u16 = 65000;
const TIMER_TICK: Duration = Duration::from_millis(100);
const LIMITER_RESET_INTERVAL: Duration = Duration::from_secs(1);
const TCP_KEEPALIVE_SECS: u64 = 30;

// Handshakes per second tolerated before cookies kick in.
const HANDSHAKE_RATE_LIMIT: u64 = 100;

/// Everything the loop needs at startup.
pub(crate) struct Dataplane {
    secret: StaticSecret,
    public: PublicKey,
    server_ip: Ipv4Addr,
    mtu: usize,
    udp: UdpSocket,
}

impl Dataplane {
    pub(crate) fn new(secret_bytes: [u8; 32], server_ip: Ipv4Addr, mtu: usize, udp: UdpSocket) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            server_ip,
            mtu,
            udp,
        }
    }
}

struct Peer {
    tunn: Tunn,
    allowed_ip: Ipv4Addr,
    endpoint: Option<SocketAddr>,
    index: u32,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Peer table with the three lookup paths the wire protocol needs:
/// static key (handshake initiations), session index (everything else),
/// and overlay IP (outbound routing).
#[derive(Default)]
struct PeerTable {
    by_key: HashMap<[u8; 32], Peer>,
    by_idx: HashMap<u32, [u8; 32]>,
    by_ip: HashMap<Ipv4Addr, [u8; 32]>,
    next_index: u32,
}

impl PeerTable {
    fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Insert or update a peer. Re-adding a known key keeps its session
    /// index and learned endpoint and swaps the allowed IP in place.
    fn insert(&mut self, secret: &StaticSecret, key: [u8; 32], allowed_ip: Ipv4Addr) -> Result<(), String> {
        let (index, endpoint) = match self.by_key.remove(&key) {
            Some(old) => {
                self.by_idx.remove(&old.index);
                self.by_ip.remove(&old.allowed_ip);
                (old.index, old.endpoint)
            }
            // Session indices are 24-bit: boringtun packs them into the
            // upper bits of the 32-bit receiver index.
            None => {
                let index = self.next_index & 0x00ff_ffff;
                self.next_index = self.next_index.wrapping_add(1);
                (index, None)
            }
        };

        let tunn = Tunn::new(
            secret.clone(),
            PublicKey::from(key),
            None,
            Some(PERSISTENT_KEEPALIVE_SECS),
            index,
            None,
        )
        .map_err(|e| e.to_string())?;

        self.by_idx.insert(index, key);
        self.by_ip.insert(allowed_ip, key);
        self.by_key.insert(
            key,
            Peer {
                tunn,
                allowed_ip,
                endpoint,
                index,
                rx_bytes: 0,
                tx_bytes: 0,
            },
        );
        Ok(())
    }

    fn remove(&mut self, key: &[u8; 32]) -> bool {
        match self.by_key.remove(key) {
            Some(peer) => {
                self.by_idx.remove(&peer.index);
                self.by_ip.remove(&peer.allowed_ip);
                true
            }
            None => false,
        }
    }
}

struct VirtualConn {
    handle: smoltcp::iface::SocketHandle,
    queues: VirtualConnQueues,
    connected: Option<tokio::sync::oneshot::Sender<Result<(), String>>>,
    outbound: VecDeque<Bytes>,
    outbound_bytes: usize,
}

// ---------------------------------------------------------------------------
// Virtual phy device: smoltcp's packet source/sink is a pair of in-memory
// queues bridged to the WireGuard session states.
// ---------------------------------------------------------------------------

struct VirtDevice {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl VirtDevice {
    fn new(mtu: usize) -> Self {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = mtu;
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            caps,
        }
    }
}

struct VirtRx(Vec<u8>);

impl RxToken for VirtRx {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

struct VirtTx<'a>(&'a mut VecDeque<Vec<u8>>);

impl<'a> TxToken for VirtTx<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        self.0.push_back(buf);
        r
    }
}

impl smoltcp::phy::Device for VirtDevice {
    type RxToken<'a> = VirtRx;
    type TxToken<'a> = VirtTx<'a>;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        self.inbound
            .pop_front()
            .map(|pkt| (VirtRx(pkt), VirtTx(&mut self.outbound)))
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(VirtTx(&mut self.outbound))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

fn clock_now() -> smoltcp::time::Instant {
    let millis = std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    smoltcp::time::Instant::from_millis(millis)
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

pub(crate) async fn run(
    plane: Dataplane,
    mut cmd_rx: mpsc::Receiver<Command>,
    loop_notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    let Dataplane {
        secret,
        public,
        server_ip,
        mtu,
        udp,
    } = plane;

    let mut device = VirtDevice::new(mtu);
    let mut iface = Interface::new(
        IfaceConfig::new(HardwareAddress::Ip),
        &mut device,
        clock_now(),
    );
    iface.update_ip_addrs(|addrs| {
        let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(server_ip), 32));
    });
    // Medium::Ip has no neighbor discovery; the next-hop value is unused.
    let _ = iface
        .routes_mut()
        .add_default_ipv4_route(Ipv4Addr::new(0, 0, 0, 1));

    let mut sockets = SocketSet::new(vec![]);
    let mut peers = PeerTable::default();
    let rate_limiter = RateLimiter::new(&public, HANDSHAKE_RATE_LIMIT);

    let mut conns: Vec<VirtualConn> = Vec::new();
    let mut next_port: u16 = LOCAL_PORT_START;

    let mut udp_buf = vec![0u8; UDP_BUF];
    let mut work_buf = vec![0u8; UDP_BUF + 32];
    let mut flush_buf = vec![0u8; UDP_BUF + 32];

    let mut timer_deadline = Instant::now();
    let mut limiter_deadline = Instant::now();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let now_std = Instant::now();
        let now = clock_now();

        if now_std >= limiter_deadline {
            rate_limiter.reset_count();
            limiter_deadline = now_std + LIMITER_RESET_INTERVAL;
        }

        if now_std >= timer_deadline {
            tick_timers(&udp, &mut peers, &mut work_buf);
            timer_deadline = now_std + TIMER_TICK;
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            handle_command(
                cmd,
                &secret,
                server_ip,
                &mut peers,
                &mut iface,
                &mut sockets,
                &mut conns,
                &mut next_port,
            );
        }

        for _ in 0..UDP_RECV_BURST {
            match udp.try_recv_from(&mut udp_buf) {
                Ok((n, src)) => ingress_packet(
                    &udp,
                    &secret,
                    &public,
                    &rate_limiter,
                    &mut peers,
                    &mut device,
                    &udp_buf[..n],
                    src,
                    &mut work_buf,
                    &mut flush_buf,
                ),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "udp receive error");
                    break;
                }
            }
        }

        let _ = iface.poll(now, &mut device, &mut sockets);

        while let Some(packet) = device.outbound.pop_front() {
            egress_packet(&udp, &mut peers, &packet, &mut work_buf);
        }

        service_conns(&mut conns, &mut sockets);

        let pending = !device.inbound.is_empty()
            || !device.outbound.is_empty()
            || conns.iter().any(|c| c.connected.is_some());
        if pending {
            tokio::task::yield_now().await;
            continue;
        }

        let stack_delay = iface
            .poll_delay(now, &sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
            .unwrap_or(TIMER_TICK);
        let timer_wait = timer_deadline.saturating_duration_since(Instant::now());
        let wait = stack_delay.min(timer_wait).min(TIMER_TICK);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = udp.readable() => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => handle_command(
                        cmd,
                        &secret,
                        server_ip,
                        &mut peers,
                        &mut iface,
                        &mut sockets,
                        &mut conns,
                        &mut next_port,
                    ),
                    // Every device handle is gone; nothing can reach us.
                    None => break,
                }
            }
            _ = loop_notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    for conn in conns.drain(..) {
        conn.queues.to_remote.close();
        conn.queues.from_remote.close();
        if let Some(connected) = conn.connected {
            let _ = connected.send(Err("device shutting down".into()));
        }
    }
    metrics().wireguard_peers_active.set(0);
    debug!("data plane stopped");
}

#[allow(clippy::too_many_arguments)]
fn handle_command(
    cmd: Command,
    secret: &StaticSecret,
    server_ip: Ipv4Addr,
    peers: &mut PeerTable,
    iface: &mut Interface,
    sockets: &mut SocketSet<'_>,
    conns: &mut Vec<VirtualConn>,
    next_port: &mut u16,
) {
    match cmd {
        Command::AddPeer {
            public_key,
            allowed_ip,
            done,
        } => {
            let result = peers.insert(secret, public_key, allowed_ip);
            if result.is_err() {
                metrics().wireguard_errors_total.inc();
            }
            metrics().wireguard_peers_active.set(peers.len() as i64);
            let _ = done.send(result);
        }
        Command::RemovePeer { public_key, done } => {
            let removed = peers.remove(&public_key);
            metrics().wireguard_peers_active.set(peers.len() as i64);
            let _ = done.send(removed);
        }
        Command::Connect {
            ip,
            port,
            queues,
            connected,
        } => {
            if !peers.by_ip.contains_key(&ip) {
                let _ = connected.send(Err(format!("no tunnel peer for {ip}")));
                return;
            }

            let mut sock = tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
                tcp::SocketBuffer::new(vec![0u8; TCP_SOCKET_BUF]),
            );
            sock.set_keep_alive(Some(smoltcp::time::Duration::from_secs(
                TCP_KEEPALIVE_SECS,
            )));

            let local_port = *next_port;
            *next_port = if *next_port >= LOCAL_PORT_END {
                LOCAL_PORT_START
            } else {
                *next_port + 1
            };

            let remote = IpEndpoint::new(IpAddress::Ipv4(ip), port);
            let local = IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(server_ip)),
                port: local_port,
            };

            match sock.connect(iface.context(), remote, local) {
                Ok(()) => {
                    let handle = sockets.add(sock);
                    conns.push(VirtualConn {
                        handle,
                        queues,
                        connected: Some(connected),
                        outbound: VecDeque::new(),
                        outbound_bytes: 0,
                    });
                }
                Err(e) => {
                    let _ = connected.send(Err(format!("connect: {e}")));
                }
            }
        }
        Command::PeerStats { reply } => {
            let stats = peers
                .by_key
                .iter()
                .map(|(key, peer)| PeerStats {
                    public_key: STANDARD.encode(key),
                    allowed_ip: peer.allowed_ip,
                    endpoint: peer.endpoint,
                    last_handshake: peer.tunn.time_since_last_handshake(),
                    rx_bytes: peer.rx_bytes,
                    tx_bytes: peer.tx_bytes,
                })
                .collect();
            let _ = reply.send(stats);
        }
    }
}

fn tick_timers(udp: &UdpSocket, peers: &mut PeerTable, work_buf: &mut [u8]) {
    for peer in peers.by_key.values_mut() {
        let Some(endpoint) = peer.endpoint else {
            continue;
        };
        match peer.tunn.update_timers(work_buf) {
            TunnResult::WriteToNetwork(packet) => {
                let _ = udp.try_send_to(packet, endpoint);
            }
            TunnResult::Err(WireGuardError::ConnectionExpired) => {}
            TunnResult::Err(e) => trace!(error = ?e, "peer timer error"),
            _ => {}
        }
    }
}

/// Decrypt one datagram and route it: handshake replies and cookies back
/// out the socket, decapsulated IP packets into the virtual interface.
#[allow(clippy::too_many_arguments)]
fn ingress_packet(
    udp: &UdpSocket,
    secret: &StaticSecret,
    public: &PublicKey,
    rate_limiter: &RateLimiter,
    peers: &mut PeerTable,
    device: &mut VirtDevice,
    datagram: &[u8],
    src: SocketAddr,
    work_buf: &mut [u8],
    flush_buf: &mut [u8],
) {
    let packet = match rate_limiter.verify_packet(Some(src.ip()), datagram, work_buf) {
        Ok(packet) => packet,
        Err(TunnResult::WriteToNetwork(cookie)) => {
            let _ = udp.try_send_to(cookie, src);
            return;
        }
        Err(_) => return,
    };

    // Handshake initiations carry the peer's encrypted static key; every
    // other message type carries our session index in its receiver field.
    let key = match &packet {
        Packet::HandshakeInit(p) => match parse_handshake_anon(secret, public, p) {
            Ok(half) => half.peer_static_public,
            Err(_) => {
                metrics().wireguard_errors_total.inc();
                return;
            }
        },
        Packet::HandshakeResponse(p) => match peers.by_idx.get(&(p.receiver_idx >> 8)) {
            Some(key) => *key,
            None => return,
        },
        Packet::PacketCookieReply(p) => match peers.by_idx.get(&(p.receiver_idx >> 8)) {
            Some(key) => *key,
            None => return,
        },
        Packet::PacketData(p) => match peers.by_idx.get(&(p.receiver_idx >> 8)) {
            Some(key) => *key,
            None => return,
        },
    };

    let Some(peer) = peers.by_key.get_mut(&key) else {
        return;
    };

    match peer.tunn.handle_verified_packet(packet, work_buf) {
        TunnResult::Done => {}
        TunnResult::Err(_) => {
            metrics().wireguard_errors_total.inc();
        }
        TunnResult::WriteToNetwork(packet) => {
            peer.endpoint = Some(src);
            let _ = udp.try_send_to(packet, src);
            // Drain packets queued while the handshake was in flight.
            loop {
                match peer.tunn.decapsulate(None, &[], flush_buf) {
                    TunnResult::WriteToNetwork(packet) => {
                        let _ = udp.try_send_to(packet, src);
                    }
                    _ => break,
                }
            }
        }
        TunnResult::WriteToTunnelV4(packet, packet_src) => {
            if packet_src == peer.allowed_ip {
                peer.endpoint = Some(src);
                peer.rx_bytes += packet.len() as u64;
                device.inbound.push_back(packet.to_vec());
            } else {
                debug!(
                    src = %packet_src,
                    allowed = %peer.allowed_ip,
                    "dropping packet outside peer's allowed IP"
                );
            }
        }
        // IPv4-only overlay
        TunnResult::WriteToTunnelV6(..) => {}
    }
}

/// Encrypt one IP packet leaving the stack toward the peer owning its
/// destination address. Packets to unknown or not-yet-handshaked peers
/// are dropped.
fn egress_packet(udp: &UdpSocket, peers: &mut PeerTable, packet: &[u8], work_buf: &mut [u8]) {
    let Some(IpAddr::V4(dst)) = Tunn::dst_address(packet) else {
        return;
    };
    let Some(key) = peers.by_ip.get(&dst).copied() else {
        return;
    };
    let Some(peer) = peers.by_key.get_mut(&key) else {
        return;
    };
    let Some(endpoint) = peer.endpoint else {
        trace!(dst = %dst, "dropping packet: peer has no endpoint yet");
        return;
    };

    match peer.tunn.encapsulate(packet, work_buf) {
        TunnResult::WriteToNetwork(out) => {
            peer.tx_bytes += packet.len() as u64;
            let _ = udp.try_send_to(out, endpoint);
        }
        TunnResult::Err(_) => {
            metrics().wireguard_errors_total.inc();
        }
        _ => {}
    }
}

/// Shuttle bytes between each virtual TCP socket and its queue pair, and
/// reap connections that have fully closed.
fn service_conns(conns: &mut Vec<VirtualConn>, sockets: &mut SocketSet<'_>) {
    let mut i = 0;
    while i < conns.len() {
        let conn = &mut conns[i];
        let sock = sockets.get_mut::<tcp::Socket>(conn.handle);
        let mut drop_conn = false;

        if let Some(tx) = conn.connected.take() {
            if sock.may_send() {
                let _ = tx.send(Ok(()));
            } else if sock.state() == tcp::State::Closed {
                let _ = tx.send(Err("connection refused".into()));
                drop_conn = true;
            } else {
                conn.connected = Some(tx);
            }
        }

        // caller -> remote
        while !drop_conn && conn.outbound_bytes < OUTBOUND_PENDING_MAX {
            let Some(chunk) = conn.queues.to_remote.try_pop() else {
                break;
            };
            conn.outbound_bytes += chunk.len();
            conn.outbound.push_back(chunk);
        }
        if !drop_conn && conn.queues.to_remote.is_closed() && conn.outbound.is_empty() {
            sock.close();
        }
        while !drop_conn && sock.can_send() {
            let Some(front) = conn.outbound.front_mut() else {
                break;
            };
            match sock.send_slice(front) {
                Ok(sent) if sent == front.len() => {
                    conn.outbound_bytes = conn.outbound_bytes.saturating_sub(sent);
                    conn.outbound.pop_front();
                }
                Ok(sent) => {
                    conn.outbound_bytes = conn.outbound_bytes.saturating_sub(sent);
                    let rest = front.slice(sent..);
                    *front = rest;
                    break;
                }
                Err(_) => break,
            }
        }

        // remote -> caller
        let mut recv_buf = [0u8; RECV_CHUNK];
        while !drop_conn && sock.can_recv() && !conn.queues.from_remote.is_full() {
            match sock.recv_slice(&mut recv_buf) {
                Ok(n) if n > 0 => {
                    let _ = conn
                        .queues
                        .from_remote
                        .try_push(Bytes::copy_from_slice(&recv_buf[..n]));
                }
                _ => break,
            }
        }

        if conn.queues.from_remote.is_closed() {
            sock.close();
            drop_conn = true;
        }

        // Remote finished sending and everything is delivered: propagate
        // EOF so the caller's read side completes.
        let remote_done = matches!(
            sock.state(),
            tcp::State::CloseWait
                | tcp::State::Closing
                | tcp::State::LastAck
                | tcp::State::TimeWait
                | tcp::State::Closed
        );
        if !drop_conn && remote_done && !sock.can_recv() && conn.queues.from_remote.is_empty() {
            conn.queues.from_remote.close();
        }

        if !drop_conn && !sock.is_open() {
            drop_conn = true;
        }

        if drop_conn {
            let conn = conns.swap_remove(i);
            conn.queues.to_remote.close();
            conn.queues.from_remote.close();
            sockets.remove(conn.handle);
        } else {
            i += 1;
        }
    }
}
