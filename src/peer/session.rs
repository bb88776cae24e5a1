//! A live session with one peer
//!
//! Each session runs two tasks: the reader forwards decrypted payloads to
//! the virtual interface, the sender drains the bounded outgoing queue
//! into the encrypted connection. Either side ending stops both.

use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{OverflowPolicy, PeerRegistry};
use crate::error::{Error, Result};
use crate::interface::{self, VirtualInterface};
use crate::transport::{SecureReader, SecureSession, SecureWriter};

/// Point-in-time traffic counters for one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets dropped because the outgoing queue was full
    pub dropped: u64,
}

/// Session state shared between the registry, the router and the session tasks
pub struct PeerSession {
    inside: IpAddr,
    outside: SocketAddr,
    outgoing: mpsc::Sender<Bytes>,
    overflow: OverflowPolicy,
    established: Instant,
    last_contact: Mutex<Instant>,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl PeerSession {
    /// Create a session and the receiving end of its outgoing queue
    pub fn new(
        inside: IpAddr,
        outside: SocketAddr,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outgoing, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();

        let session = Arc::new(Self {
            inside,
            outside,
            outgoing,
            overflow,
            established: now,
            last_contact: Mutex::new(now),
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        (session, rx)
    }

    pub fn inside_addr(&self) -> IpAddr {
        self.inside
    }

    pub fn outside_addr(&self) -> SocketAddr {
        self.outside
    }

    pub fn established(&self) -> Instant {
        self.established
    }

    /// When we last received anything from this peer
    pub fn last_contact(&self) -> Instant {
        *self.last_contact.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Queue a packet for this peer, applying the overflow policy when full
    pub async fn queue(&self, packet: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed(self.outside));
        }

        match self.overflow {
            OverflowPolicy::DropNewest => match self.outgoing.try_send(packet) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(Error::QueueFull(self.outside))
                }
                Err(TrySendError::Closed(_)) => Err(Error::ConnectionClosed(self.outside)),
            },
            OverflowPolicy::Block(budget) => {
                match tokio::time::timeout(budget, self.outgoing.send(packet)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(Error::ConnectionClosed(self.outside)),
                    Err(_) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        Err(Error::QueueFull(self.outside))
                    }
                }
            }
        }
    }

    /// Spawn the reader and sender tasks over an established session
    pub fn start(
        self: &Arc<Self>,
        session: SecureSession,
        outgoing: mpsc::Receiver<Bytes>,
        interface: Arc<dyn VirtualInterface>,
        registry: Arc<PeerRegistry>,
    ) {
        let (reader, writer) = session.into_split();
        tokio::spawn(read_loop(Arc::clone(self), reader, interface, registry));
        tokio::spawn(send_loop(Arc::clone(self), writer, outgoing));
    }

    /// Stop both tasks; the sender notifies the peer on its way out
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session has been stopped
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    fn record_rx(&self, len: usize) {
        *self.last_contact.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_tx(&self, len: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("inside", &self.inside)
            .field("outside", &self.outside)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn read_loop(
    peer: Arc<PeerSession>,
    mut reader: SecureReader,
    interface: Arc<dyn VirtualInterface>,
    registry: Arc<PeerRegistry>,
) {
    loop {
        let payload = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            result = reader.recv() => match result {
                Ok(payload) => payload,
                Err(e) if e.is_closed() => {
                    tracing::info!("Session with {} ({}) ended: {}", peer.inside, peer.outside, e);
                    break;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!("Transient error reading from {}: {}", peer.outside, e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", peer.outside, e);
                    break;
                }
            },
        };

        peer.record_rx(payload.len());

        if let Some(source) = interface::source(&payload) {
            if source != peer.inside {
                tracing::trace!("Packet from peer {} carries source address {}", peer.inside, source);
            }
        }

        match interface.send_packet(&payload).await {
            Ok(written) if written != payload.len() => {
                tracing::warn!(
                    "Partial write to interface for packet from {}: {} of {} bytes",
                    peer.inside,
                    written,
                    payload.len()
                );
            }
            Ok(_) => {}
            Err(e) if e.is_closed() => {
                tracing::debug!("Interface closed, ending session with {}", peer.outside);
                break;
            }
            Err(e) => tracing::warn!("Error writing packet from {} to interface: {}", peer.inside, e),
        }
    }

    if registry.remove_session(&peer) {
        tracing::info!(
            "Peer {} ({}) removed after {:?}, last heard {:?} ago",
            peer.inside,
            peer.outside,
            peer.established().elapsed(),
            peer.last_contact().elapsed()
        );
    }
    peer.stop();
}

async fn send_loop(peer: Arc<PeerSession>, mut writer: SecureWriter, mut outgoing: mpsc::Receiver<Bytes>) {
    loop {
        let packet = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            packet = outgoing.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        match writer.send(&packet).await {
            Ok(sent) if sent != packet.len() => {
                tracing::warn!(
                    "Partial write to {}: {} of {} bytes",
                    peer.outside,
                    sent,
                    packet.len()
                );
                peer.record_tx(sent);
            }
            Ok(sent) => peer.record_tx(sent),
            Err(e) if e.is_closed() => {
                tracing::debug!("Connection to {} closed while sending: {}", peer.outside, e);
                break;
            }
            Err(e) => tracing::warn!("Error sending packet to {}: {}", peer.outside, e),
        }
    }

    if let Err(e) = writer.close().await {
        tracing::debug!("Failed to send close_notify to {}: {}", peer.outside, e);
    }
    peer.stop();
}
