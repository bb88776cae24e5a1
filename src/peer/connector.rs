//! Peer connector
//!
//! Turns network maps into sessions. For every pair of members exactly one
//! side dials: the one with the lower outside address. The other side
//! sends a priming probe so its NAT lets the dialler's handshake in, then
//! waits for the inbound session on the accept path.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{OverflowPolicy, PeerRegistry, PeerSession};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::interface::VirtualInterface;
use crate::protocol::NetworkMap;
use crate::transport::{MultiplexedConn, SecureSession};

/// Our part in establishing a session with one other member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We have the lower address and open the session
    Dial,
    /// The other side dials; we prime our NAT and accept
    Wait,
    /// Both addresses are equal, which a correct caller never asks about
    SelfComparison,
}

/// Decide who dials: lower IP first, then lower port
pub fn negotiate_role(me: SocketAddr, other: SocketAddr) -> Role {
    match (me.ip(), me.port()).cmp(&(other.ip(), other.port())) {
        Ordering::Less => Role::Dial,
        Ordering::Greater => Role::Wait,
        Ordering::Equal => Role::SelfComparison,
    }
}

/// Tunables for connection attempts and new sessions
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// How long a dialler waits to swallow the peer's priming probe
    pub probe_drain_timeout: Duration,
    /// After this long an unfinished attempt may be retried
    pub attempt_timeout: Duration,
    /// Outgoing queue capacity for each session
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl ConnectorOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            probe_drain_timeout: config.probe_drain_timeout(),
            attempt_timeout: config.handshake_timeout() + config.probe_drain_timeout(),
            queue_capacity: config.outgoing_queue_capacity,
            overflow: config.overflow_policy(),
        }
    }
}

/// Establishes and tears down peer sessions as membership changes
pub struct PeerConnector {
    transport: Arc<MultiplexedConn>,
    registry: Arc<PeerRegistry>,
    interface: Arc<dyn VirtualInterface>,
    options: ConnectorOptions,
    /// Our outside address as last reported by the rendezvous
    me: Mutex<Option<SocketAddr>>,
    /// Outside addresses with a dial or an expected inbound session in flight
    pending: Mutex<HashMap<SocketAddr, Instant>>,
    /// Members listed by the previous network map
    members: Mutex<HashSet<SocketAddr>>,
    shutdown: CancellationToken,
}

impl PeerConnector {
    pub fn new(
        transport: Arc<MultiplexedConn>,
        registry: Arc<PeerRegistry>,
        interface: Arc<dyn VirtualInterface>,
        options: ConnectorOptions,
    ) -> Self {
        Self {
            transport,
            registry,
            interface,
            options,
            me: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            members: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Our outside address, once a network map has told us
    pub fn outside_addr(&self) -> Option<SocketAddr> {
        *self.me.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// React to a fresh network map: drop sessions with departed members,
    /// then dial or prime every member we have no session with
    pub fn on_network_map_update(self: &Arc<Self>, map: &NetworkMap) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let Some(me) = map.me() else {
            tracing::warn!("Network map without our own address, ignoring");
            return;
        };

        {
            let mut current = self.me.lock().unwrap_or_else(|e| e.into_inner());
            if *current != Some(me) {
                tracing::info!("Outside address is {}", me);
                *current = Some(me);
            }
        }

        self.evict_departed(map);

        for other in map.others() {
            if self.registry.contains_outside(&other) {
                continue;
            }

            match negotiate_role(me, other) {
                Role::Dial => {
                    if self.begin_attempt(other) {
                        self.spawn_dial(other);
                    }
                }
                Role::Wait => {
                    if self.begin_attempt(other) {
                        self.prime(other);
                    }
                }
                Role::SelfComparison => {
                    debug_assert!(false, "asked to negotiate a session with ourselves ({})", me);
                    tracing::error!("Network map lists our own address {} as another member", me);
                }
            }
        }
    }

    /// Stop sessions with members the previous map listed and this one does not.
    /// Sessions from addresses no map has listed are left alone.
    fn evict_departed(&self, map: &NetworkMap) {
        let departed: HashSet<SocketAddr> = {
            let current: HashSet<SocketAddr> = map.addresses.iter().copied().collect();
            let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            let departed = members.difference(&current).copied().collect();
            *members = current;
            departed
        };

        for session in self.registry.sessions() {
            if !departed.contains(&session.outside_addr()) {
                continue;
            }
            if self.registry.remove_session(&session) {
                tracing::info!(
                    "Peer {} ({}) left the network",
                    session.inside_addr(),
                    session.outside_addr()
                );
                session.stop();
            }
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|addr, _| map.contains(addr));
    }

    /// Mark an attempt as started; false if a recent one is still in flight
    fn begin_attempt(&self, remote: SocketAddr) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match pending.get(&remote) {
            Some(started) if now.duration_since(*started) < self.options.attempt_timeout => false,
            _ => {
                pending.insert(remote, now);
                true
            }
        }
    }

    fn finish_attempt(&self, remote: &SocketAddr) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(remote);
    }

    /// Number of attempts currently in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Open our NAT towards a member that will dial us
    fn prime(self: &Arc<Self>, remote: SocketAddr) {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            match connector.transport.send_probe(remote).await {
                Ok(()) => tracing::debug!("Sent priming probe to {}, awaiting its session", remote),
                Err(e) => {
                    tracing::warn!("Failed to probe {}: {}", remote, e);
                    connector.finish_attempt(&remote);
                }
            }
        });
    }

    fn spawn_dial(self: &Arc<Self>, remote: SocketAddr) {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = connector.shutdown.cancelled() => Err(Error::Cancelled),
                result = connector.dial(remote) => result,
            };
            connector.finish_attempt(&remote);

            match result {
                Ok(session) => connector.register(session),
                Err(Error::Cancelled) => {}
                Err(e) => tracing::warn!("Could not connect to {}: {}", remote, e),
            }
        });
    }

    async fn dial(&self, remote: SocketAddr) -> Result<SecureSession> {
        tracing::debug!("Dialling {}", remote);
        let mut conn = self.transport.dial_plain(remote)?;

        // The peer's probe may arrive on this route; it must not reach the handshake
        match tokio::time::timeout(self.options.probe_drain_timeout, conn.recv()).await {
            Ok(Some(datagram)) => {
                tracing::trace!("Drained {} byte probe from {}", datagram.len(), remote)
            }
            Ok(None) => return Err(Error::TransportClosed),
            Err(_) => tracing::trace!("No probe from {} before handshake", remote),
        }

        self.transport.upgrade_client(conn).await
    }

    /// Accept inbound sessions until the transport closes
    pub async fn listen_for_peers(self: Arc<Self>) {
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.transport.accept_encrypted() => result,
            };

            match result {
                Ok(session) => {
                    self.finish_attempt(&session.remote_addr());
                    self.register(session);
                }
                Err(e) if e.is_closed() => break,
                Err(e) => tracing::warn!("Error accepting peer session: {}", e),
            }
        }
        tracing::debug!("Stopped listening for peers");
    }

    /// Hand an established session to the registry and start its tasks
    fn register(&self, session: SecureSession) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let inside = session.remote_identity();
        let outside = session.remote_addr();
        let side = session.side();

        let (peer, outgoing) = PeerSession::new(inside, outside, self.options.queue_capacity, self.options.overflow);
        for displaced in self.registry.add(Arc::clone(&peer)) {
            tracing::info!(
                "Replacing session with {} ({})",
                displaced.inside_addr(),
                displaced.outside_addr()
            );
            displaced.stop();
        }

        peer.start(session, outgoing, Arc::clone(&self.interface), Arc::clone(&self.registry));
        tracing::info!("Connected to peer {} at {} ({:?} side)", inside, outside, side);
    }

    /// Stop connecting and end every session
    pub fn stop(&self) {
        self.shutdown.cancel();
        for session in self.registry.drain() {
            session.stop();
        }
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.members.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::packet_pipe;
    use crate::transport::testing::{bind_local, test_config};
    use crate::transport::PROBE_PAYLOAD;
    use tokio::time::timeout;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lower_ip_dials() {
        assert_eq!(negotiate_role(addr("10.0.0.1:5000"), addr("10.0.0.2:1000")), Role::Dial);
        assert_eq!(negotiate_role(addr("10.0.0.2:1000"), addr("10.0.0.1:5000")), Role::Wait);
    }

    #[test]
    fn test_port_breaks_ties() {
        assert_eq!(negotiate_role(addr("127.0.0.1:4000"), addr("127.0.0.1:4001")), Role::Dial);
        assert_eq!(negotiate_role(addr("127.0.0.1:4001"), addr("127.0.0.1:4000")), Role::Wait);
    }

    #[test]
    fn test_roles_are_complementary() {
        let pairs = [
            ("192.168.1.10:3000", "192.168.1.9:3000"),
            ("8.8.8.8:53", "1.1.1.1:53"),
            ("[2001:db8::1]:7000", "10.0.0.1:7000"),
        ];
        for (a, b) in pairs {
            let forward = negotiate_role(addr(a), addr(b));
            let reverse = negotiate_role(addr(b), addr(a));
            assert_ne!(forward, reverse);
            assert_ne!(forward, Role::SelfComparison);
        }
    }

    #[test]
    fn test_self_comparison() {
        assert_eq!(
            negotiate_role(addr("127.0.0.1:4000"), addr("127.0.0.1:4000")),
            Role::SelfComparison
        );
    }

    async fn connector(identity: &str) -> (Arc<PeerConnector>, Arc<PeerRegistry>, crate::interface::HostEnd) {
        connector_on(bind_local(identity).await).await
    }

    async fn connector_on(
        transport: MultiplexedConn,
    ) -> (Arc<PeerConnector>, Arc<PeerRegistry>, crate::interface::HostEnd) {
        let transport = Arc::new(transport);
        let registry = Arc::new(PeerRegistry::new());
        let (pipe, host) = packet_pipe(16);
        let options = ConnectorOptions {
            probe_drain_timeout: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(3),
            queue_capacity: 16,
            overflow: OverflowPolicy::DropNewest,
        };
        let connector = Arc::new(PeerConnector::new(transport, Arc::clone(&registry), Arc::new(pipe), options));
        (connector, registry, host)
    }

    async fn wait_for_peers(registry: &PeerRegistry, count: usize) {
        timeout(Duration::from_secs(5), async {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_map_update_connects_both_sides() {
        let (a, registry_a, _host_a) = connector("10.0.0.1").await;
        let (b, registry_b, _host_b) = connector("10.0.0.2").await;

        tokio::spawn(Arc::clone(&a).listen_for_peers());
        tokio::spawn(Arc::clone(&b).listen_for_peers());

        let addrs = vec![a.transport.local_addr().unwrap(), b.transport.local_addr().unwrap()];
        a.on_network_map_update(&NetworkMap::new(addrs.clone(), 0));
        b.on_network_map_update(&NetworkMap::new(addrs.clone(), 1));

        wait_for_peers(&registry_a, 1).await;
        wait_for_peers(&registry_b, 1).await;

        assert!(registry_a.get_by_inside(&"10.0.0.2".parse().unwrap()).is_some());
        assert!(registry_b.get_by_inside(&"10.0.0.1".parse().unwrap()).is_some());
        assert_eq!(a.outside_addr(), Some(addrs[0]));

        // A repeated map changes nothing
        a.on_network_map_update(&NetworkMap::new(addrs.clone(), 0));
        b.on_network_map_update(&NetworkMap::new(addrs, 1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry_a.len(), 1);
        assert_eq!(registry_b.len(), 1);

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_departed_member_is_evicted() {
        let (a, registry_a, _host_a) = connector("10.0.0.1").await;
        let (b, registry_b, _host_b) = connector("10.0.0.2").await;

        tokio::spawn(Arc::clone(&a).listen_for_peers());
        tokio::spawn(Arc::clone(&b).listen_for_peers());

        let a_addr = a.transport.local_addr().unwrap();
        let b_addr = b.transport.local_addr().unwrap();
        a.on_network_map_update(&NetworkMap::new(vec![a_addr, b_addr], 0));
        b.on_network_map_update(&NetworkMap::new(vec![a_addr, b_addr], 1));
        wait_for_peers(&registry_a, 1).await;

        let session = registry_a.get_by_outside(&b_addr).unwrap();
        a.on_network_map_update(&NetworkMap::new(vec![a_addr], 0));

        assert!(registry_a.is_empty());
        assert!(session.is_stopped());
        // b hears the close_notify and drops its side as well
        wait_for_peers(&registry_b, 0).await;

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_waiting_side_only_probes() {
        let (a, registry_a, _host_a) = connector("10.0.0.1").await;
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.transport.local_addr().unwrap();

        // A member at a lower address than ours: we must wait, not dial
        let lower = addr("127.0.0.1:1");
        assert_eq!(negotiate_role(a_addr, lower), Role::Wait);
        a.on_network_map_update(&NetworkMap::new(vec![lower, a_addr], 1));
        assert_eq!(a.pending_count(), 1);
        assert_eq!(a.transport.route_count(), 0);

        // A member above us gets dialled
        let higher = silent.local_addr().unwrap();
        let role = negotiate_role(a_addr, higher);
        a.on_network_map_update(&NetworkMap::new(vec![lower, a_addr, higher], 1));
        if role == Role::Dial {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(a.transport.route_count(), 1);
        }
        assert_eq!(a.pending_count(), 2);
        assert!(registry_a.is_empty());

        a.stop();
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_waiting_side_primes_fresh_socket() {
        let transport = MultiplexedConn::bind("127.0.0.2:0".parse().unwrap(), test_config("10.0.0.2"))
            .await
            .unwrap();
        let (a, _registry, _host) = connector_on(transport).await;
        let a_addr = a.transport.local_addr().unwrap();

        let lower = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let lower_addr = lower.local_addr().unwrap();
        assert_eq!(negotiate_role(a_addr, lower_addr), Role::Wait);

        a.on_network_map_update(&NetworkMap::new(vec![lower_addr, a_addr], 1));

        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(1), lower.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], PROBE_PAYLOAD);
        assert_eq!(from, a_addr);

        // A delivered probe keeps the attempt pending until the session arrives
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.pending_count(), 1);

        a.stop();
    }

    #[tokio::test]
    async fn test_only_departed_members_are_evicted() {
        let (a, registry_a, _host_a) = connector("10.0.0.1").await;
        let a_addr = a.transport.local_addr().unwrap();
        let member = addr("127.0.0.1:1");

        // Accepted from an address the rendezvous never reported
        let (unlisted, _rx) = PeerSession::new(
            "10.0.0.7".parse().unwrap(),
            addr("127.0.0.1:9"),
            4,
            OverflowPolicy::DropNewest,
        );
        registry_a.add(Arc::clone(&unlisted));

        for _ in 0..3 {
            a.on_network_map_update(&NetworkMap::new(vec![member, a_addr], 1));
        }
        a.on_network_map_update(&NetworkMap::new(vec![a_addr], 0));
        assert!(!unlisted.is_stopped());
        assert_eq!(registry_a.len(), 1);

        // Listed once, then gone: that member left
        let (listed, _rx) = PeerSession::new(
            "10.0.0.8".parse().unwrap(),
            member,
            4,
            OverflowPolicy::DropNewest,
        );
        registry_a.add(Arc::clone(&listed));
        a.on_network_map_update(&NetworkMap::new(vec![member, a_addr], 1));
        assert!(!listed.is_stopped());
        a.on_network_map_update(&NetworkMap::new(vec![a_addr], 0));
        assert!(listed.is_stopped());
        assert!(registry_a.get_by_outside(&member).is_none());
        assert!(!unlisted.is_stopped());

        a.stop();
    }

    #[tokio::test]
    async fn test_stop_drains_registry() {
        let (a, registry_a, _host_a) = connector("10.0.0.1").await;
        let (peer, _rx) = PeerSession::new(
            "10.0.0.9".parse().unwrap(),
            addr("127.0.0.1:9"),
            4,
            OverflowPolicy::DropNewest,
        );
        registry_a.add(Arc::clone(&peer));

        a.stop();
        assert!(registry_a.is_empty());
        assert!(peer.is_stopped());

        // Further maps are ignored once stopped
        a.on_network_map_update(&NetworkMap::new(vec![addr("127.0.0.1:1"), addr("127.0.0.1:2")], 0));
        assert_eq!(a.pending_count(), 0);
    }
}
