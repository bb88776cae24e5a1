//! Rendezvous server
//!
//! Members send heartbeats naming their mesh. The server records the
//! source address of each heartbeat and periodically tells every member of
//! a mesh the full, sorted member list together with the member's own
//! position in it. A member joining triggers an immediate broadcast.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{Heartbeat, NetworkMap, MAX_DATAGRAM};

/// Members of one named mesh
pub struct MeshNetwork {
    name: String,
    members: Mutex<HashMap<SocketAddr, Instant>>,
    joined: Notify,
}

impl MeshNetwork {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(HashMap::new()),
            joined: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refresh a member's last-seen time; true if it was not a member before
    pub fn touch(&self, addr: SocketAddr, now: Instant) -> bool {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        members.insert(addr, now).is_none()
    }

    /// Drop members silent for longer than `timeout` and return
    /// (evicted, survivors sorted) taken under a single lock
    pub fn evict_and_snapshot(&self, now: Instant, timeout: Duration) -> (Vec<SocketAddr>, Vec<SocketAddr>) {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<SocketAddr> = members
            .iter()
            .filter(|(_, last_seen)| now.saturating_duration_since(**last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &expired {
            members.remove(addr);
        }

        let mut survivors: Vec<SocketAddr> = members.keys().copied().collect();
        survivors.sort();
        (expired, survivors)
    }

    /// Members heard from within `timeout` of `now`, sorted; nothing is evicted
    pub fn live_members(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        let mut addrs: Vec<SocketAddr> = members
            .iter()
            .filter(|(_, last_seen)| now.saturating_duration_since(**last_seen) <= timeout)
            .map(|(addr, _)| *addr)
            .collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rendezvous service for any number of meshes
pub struct RendezvousServer {
    socket: Arc<UdpSocket>,
    networks: Mutex<HashMap<String, Arc<MeshNetwork>>>,
    broadcast_interval: Duration,
    member_timeout: Duration,
    shutdown: CancellationToken,
}

impl RendezvousServer {
    pub fn new(socket: UdpSocket, broadcast_interval: Duration, member_timeout: Duration) -> Self {
        Self {
            socket: Arc::new(socket),
            networks: Mutex::new(HashMap::new()),
            broadcast_interval,
            member_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn bind(addr: SocketAddr, broadcast_interval: Duration, member_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(socket, broadcast_interval, member_timeout))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive heartbeats until stopped
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Rendezvous listening on {} (broadcast every {:?}, timeout {:?})",
            self.local_addr()?,
            self.broadcast_interval,
            self.member_timeout
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        let e = Error::from(e);
                        if !e.is_transient() {
                            tracing::warn!("Rendezvous receive error: {}", e);
                        }
                        continue;
                    }
                },
            };

            match Heartbeat::decode(&buf[..len]) {
                Ok(heartbeat) => self.register(&heartbeat.network_name, from),
                Err(e) => tracing::debug!("Ignoring malformed heartbeat from {}: {}", from, e),
            }
        }

        tracing::info!("Rendezvous stopped");
        Ok(())
    }

    /// Record a heartbeat from `addr` for `network_name`
    pub fn register(&self, network_name: &str, addr: SocketAddr) {
        let network = self.network(network_name);
        if network.touch(addr, Instant::now()) {
            tracing::info!("{} joined network {}", addr, network_name);
            network.joined.notify_one();
        } else {
            tracing::trace!("Heartbeat from {} for {}", addr, network_name);
        }
    }

    /// Get a network, creating it and its broadcaster on first use
    fn network(&self, name: &str) -> Arc<MeshNetwork> {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(network) = networks.get(name) {
            return Arc::clone(network);
        }

        let network = Arc::new(MeshNetwork::new(name));
        networks.insert(name.to_string(), Arc::clone(&network));

        tracing::debug!("Created network {}", name);
        tokio::spawn(broadcast_loop(
            Arc::clone(&self.socket),
            Arc::clone(&network),
            self.broadcast_interval,
            self.member_timeout,
            self.shutdown.clone(),
        ));

        network
    }

    /// Live members of a network, sorted; members past the timeout are excluded
    pub fn members(&self, network_name: &str) -> Vec<SocketAddr> {
        let network = {
            let networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
            match networks.get(network_name) {
                Some(network) => Arc::clone(network),
                None => return Vec::new(),
            }
        };

        network.live_members(Instant::now(), self.member_timeout)
    }

    /// Names of every network seen so far
    pub fn network_names(&self) -> Vec<String> {
        let networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop receiving and broadcasting
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn broadcast_loop(
    socket: Arc<UdpSocket>,
    network: Arc<MeshNetwork>,
    interval: Duration,
    member_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once; the join that created us broadcasts instead
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = network.joined.notified() => ticker.reset(),
        }

        broadcast_round(&socket, &network, member_timeout).await;
    }

    tracing::debug!("Broadcaster for {} stopped", network.name);
}

/// Evict silent members, then send every remaining member its view
async fn broadcast_round(socket: &UdpSocket, network: &MeshNetwork, member_timeout: Duration) {
    let (evicted, snapshot) = network.evict_and_snapshot(Instant::now(), member_timeout);
    for addr in evicted {
        tracing::info!("{} timed out of network {}", addr, network.name);
    }

    if snapshot.is_empty() {
        return;
    }

    for (index, addr) in snapshot.iter().enumerate() {
        let message = match NetworkMap::new(snapshot.clone(), index).encode() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("Failed to encode network map: {}", e);
                return;
            }
        };

        if let Err(e) = socket.send_to(&message, addr).await {
            tracing::warn!("Failed to send network map to {}: {}", addr, e);
        }
    }

    tracing::trace!("Broadcast {} members of {}", snapshot.len(), network.name);
}
