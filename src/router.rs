//! Outbound packet router
//!
//! Reads packets from the virtual interface and hands each one to the
//! session owning its destination inside address.

use bytes::Bytes;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::interface::{self, VirtualInterface};
use crate::peer::PeerRegistry;
use crate::protocol::MAX_DATAGRAM;

/// What happened to one outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the peer's outgoing queue
    Queued(IpAddr),
    /// No session owns the destination
    NoRoute(IpAddr),
    /// Not an IPv4/IPv6 packet we can route
    Unparseable,
    /// The peer's queue refused it
    Dropped(IpAddr),
}

/// Routes packets from the interface to peer sessions
pub struct TunRouter {
    interface: Arc<dyn VirtualInterface>,
    registry: Arc<PeerRegistry>,
    shutdown: CancellationToken,
}

impl TunRouter {
    pub fn new(interface: Arc<dyn VirtualInterface>, registry: Arc<PeerRegistry>) -> Self {
        Self {
            interface,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Route packets until stopped or the interface closes
    pub async fn run(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.interface.recv_packet(&mut buf) => result,
            };

            let len = match result {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e) if e.is_closed() => {
                    tracing::debug!("Interface closed, router exiting");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Error reading from interface: {}", e);
                    continue;
                }
            };

            self.route(&buf[..len]).await;
        }

        tracing::debug!("Router stopped");
    }

    /// Route a single packet
    pub async fn route(&self, packet: &[u8]) -> RouteOutcome {
        let Some(destination) = interface::destination(packet) else {
            tracing::trace!("Dropping unparseable {} byte packet", packet.len());
            return RouteOutcome::Unparseable;
        };

        let Some(peer) = self.registry.get_by_inside(&destination) else {
            tracing::debug!("No peer for {}, dropping packet", destination);
            return RouteOutcome::NoRoute(destination);
        };

        match peer.queue(Bytes::copy_from_slice(packet)).await {
            Ok(()) => RouteOutcome::Queued(destination),
            Err(Error::QueueFull(outside)) => {
                tracing::debug!("Queue for {} ({}) full, dropping packet", destination, outside);
                RouteOutcome::Dropped(destination)
            }
            Err(e) => {
                tracing::debug!("Could not queue packet for {}: {}", destination, e);
                RouteOutcome::Dropped(destination)
            }
        }
    }

    /// Stop routing and close the interface
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.interface.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::packet_pipe;
    use crate::interface::testing::ipv4_packet;
    use crate::peer::{OverflowPolicy, PeerSession};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_routes_by_destination() {
        let (pipe, host) = packet_pipe(8);
        let registry = Arc::new(PeerRegistry::new());
        let (peer, mut outgoing) = PeerSession::new(
            "192.168.50.2".parse().unwrap(),
            "127.0.0.1:4000".parse().unwrap(),
            8,
            OverflowPolicy::DropNewest,
        );
        registry.add(peer);

        let router = Arc::new(TunRouter::new(Arc::new(pipe), Arc::clone(&registry)));
        let task = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.run().await }
        });

        let packet = ipv4_packet([192, 168, 50, 1], [192, 168, 50, 2], b"routed");
        host.inject(&packet).await.unwrap();

        let queued = timeout(Duration::from_secs(1), outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(&queued[..], &packet[..]);

        router.stop();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_destination_dropped() {
        let (pipe, _host) = packet_pipe(8);
        let router = TunRouter::new(Arc::new(pipe), Arc::new(PeerRegistry::new()));

        let packet = ipv4_packet([192, 168, 50, 1], [192, 168, 50, 77], b"nobody");
        assert_eq!(
            router.route(&packet).await,
            RouteOutcome::NoRoute("192.168.50.77".parse().unwrap())
        );
        assert_eq!(router.route(b"junk").await, RouteOutcome::Unparseable);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (pipe, _host) = packet_pipe(8);
        let registry = Arc::new(PeerRegistry::new());
        let (peer, _outgoing) = PeerSession::new(
            "192.168.50.2".parse().unwrap(),
            "127.0.0.1:4000".parse().unwrap(),
            1,
            OverflowPolicy::DropNewest,
        );
        registry.add(Arc::clone(&peer));
        let router = TunRouter::new(Arc::new(pipe), registry);

        let packet = ipv4_packet([192, 168, 50, 1], [192, 168, 50, 2], b"x");
        let dst: IpAddr = "192.168.50.2".parse().unwrap();
        assert_eq!(router.route(&packet).await, RouteOutcome::Queued(dst));
        assert_eq!(router.route(&packet).await, RouteOutcome::Dropped(dst));
        assert_eq!(peer.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_run() {
        let (pipe, _host) = packet_pipe(8);
        let router = Arc::new(TunRouter::new(Arc::new(pipe), Arc::new(PeerRegistry::new())));
        let task = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.run().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        router.stop();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
