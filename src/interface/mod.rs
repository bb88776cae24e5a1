//! Virtual network interfaces
//!
//! The router and peer sessions only see the `VirtualInterface` trait:
//! a Linux TUN device in production, an in-memory `PacketPipe` in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub mod tun;

#[cfg(target_os = "linux")]
pub use tun::TunDevice;

/// A packet-oriented interface carrying raw IP packets
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Read one packet into `buf`, returning its length
    async fn recv_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet, returning the number of bytes accepted
    async fn send_packet(&self, packet: &[u8]) -> Result<usize>;

    /// Close the interface; pending and later calls fail with `InterfaceClosed`
    fn close(&self);
}

/// Extract the destination address of a raw IPv4 or IPv6 packet
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Extract the source address of a raw IPv4 or IPv6 packet
pub fn source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ))),
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// In-memory interface; the paired `HostEnd` plays the local OS
pub struct PacketPipe {
    from_host: Mutex<mpsc::Receiver<Bytes>>,
    to_host: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// The "operating system" side of a `PacketPipe`
pub struct HostEnd {
    to_mesh: mpsc::Sender<Bytes>,
    from_mesh: Mutex<mpsc::Receiver<Bytes>>,
}

/// Create a connected pipe with `capacity` packets of buffering each way
pub fn packet_pipe(capacity: usize) -> (PacketPipe, HostEnd) {
    let (to_mesh, from_host) = mpsc::channel(capacity);
    let (to_host, from_mesh) = mpsc::channel(capacity);

    (
        PacketPipe {
            from_host: Mutex::new(from_host),
            to_host,
            closed: CancellationToken::new(),
        },
        HostEnd {
            to_mesh,
            from_mesh: Mutex::new(from_mesh),
        },
    )
}

#[async_trait]
impl VirtualInterface for PacketPipe {
    async fn recv_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut from_host = self.from_host.lock().await;
        let packet = tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::InterfaceClosed),
            packet = from_host.recv() => packet.ok_or(Error::InterfaceClosed)?,
        };

        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn send_packet(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::InterfaceClosed);
        }
        self.to_host
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| Error::InterfaceClosed)?;
        Ok(packet.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl HostEnd {
    /// Hand a packet to the mesh as if the OS had routed it into the interface
    pub async fn inject(&self, packet: &[u8]) -> Result<()> {
        self.to_mesh
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| Error::InterfaceClosed)
    }

    /// Next packet the mesh delivered to this host; `None` once the pipe is gone
    pub async fn next_packet(&self) -> Option<Bytes> {
        self.from_mesh.lock().await.recv().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    /// Minimal IPv4 header (no options) followed by `payload`
    pub fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet.extend_from_slice(payload);
        packet
    }
}
