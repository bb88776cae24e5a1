//! Mesh member
//!
//! Wires one member together: the multiplexed transport, the rendezvous
//! client feeding network maps to the peer connector, the peer registry,
//! and the router reading the local virtual interface.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{TransportConfig, WolfMeshConfig};
use crate::error::{Error, Result};
use crate::interface::VirtualInterface;
use crate::peer::{ConnectorOptions, PeerConnector, PeerRegistry, PeerSession};
use crate::protocol::NetworkMap;
use crate::rendezvous::{NetworkMapCallback, RendezvousClient};
use crate::router::TunRouter;
use crate::transport::{MultiplexedConn, SessionConfig};

/// Everything a member needs to join a mesh
#[derive(Debug, Clone)]
pub struct MemberOptions {
    pub network_name: String,
    pub psk: Vec<u8>,
    /// Our address on the virtual network
    pub inside_address: IpAddr,
    pub rendezvous: SocketAddr,
    /// Local address for the multiplexed socket
    pub bind_address: SocketAddr,
    pub heartbeat_interval: Duration,
    pub transport: TransportConfig,
}

impl MemberOptions {
    /// Build options from a validated configuration, resolving the rendezvous host
    pub async fn from_config(config: &WolfMeshConfig) -> Result<Self> {
        config.validate_member()?;

        let (inside_address, _) = config.interface.inside_address()?;

        let rendezvous = tokio::net::lookup_host(config.member.rendezvous_address.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                Error::Config(format!(
                    "rendezvous address {} did not resolve",
                    config.member.rendezvous_address
                ))
            })?;

        let bind_address = config.member.bind_address.parse().map_err(|_| {
            Error::Config(format!("invalid member.bind_address: {}", config.member.bind_address))
        })?;

        Ok(Self {
            network_name: config.member.network_name.clone(),
            psk: config.member.psk.as_bytes().to_vec(),
            inside_address,
            rendezvous,
            bind_address,
            heartbeat_interval: config.heartbeat_interval(),
            transport: config.transport.clone(),
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(&self.psk, self.inside_address)
            .with_timeouts(self.transport.handshake_timeout(), self.transport.retransmit_interval())
    }
}

/// One running member of a mesh
pub struct MeshMember {
    network_name: String,
    inside_address: IpAddr,
    transport: Arc<MultiplexedConn>,
    registry: Arc<PeerRegistry>,
    connector: Arc<PeerConnector>,
    rendezvous: Arc<RendezvousClient>,
    router: Arc<TunRouter>,
}

impl MeshMember {
    pub async fn new(interface: Arc<dyn VirtualInterface>, options: MemberOptions) -> Result<Self> {
        let transport = Arc::new(MultiplexedConn::bind(options.bind_address, options.session_config()).await?);
        tracing::debug!("Mesh key fingerprint {}", transport.session_config().psk.fingerprint());
        let rendezvous_conn = transport.dial_plain(options.rendezvous)?;

        let registry = Arc::new(PeerRegistry::new());
        let connector = Arc::new(PeerConnector::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&interface),
            ConnectorOptions::from_config(&options.transport),
        ));

        let callback: NetworkMapCallback = {
            let connector = Arc::clone(&connector);
            Arc::new(move |map: NetworkMap| connector.on_network_map_update(&map))
        };
        let rendezvous = Arc::new(RendezvousClient::new(
            options.network_name.as_str(),
            rendezvous_conn,
            options.heartbeat_interval,
            callback,
        ));

        let router = Arc::new(TunRouter::new(interface, Arc::clone(&registry)));

        tracing::info!(
            "Member {} of {} bound to {}",
            options.inside_address,
            options.network_name,
            transport.local_addr()?
        );

        Ok(Self {
            network_name: options.network_name,
            inside_address: options.inside_address,
            transport,
            registry,
            connector,
            rendezvous,
            router,
        })
    }

    /// Run until stopped
    pub async fn run(&self) -> Result<()> {
        let (_, _, rendezvous) = tokio::join!(
            self.router.run(),
            Arc::clone(&self.connector).listen_for_peers(),
            self.rendezvous.run(),
        );
        tracing::info!("Member {} left {}", self.inside_address, self.network_name);
        rendezvous
    }

    /// Leave the mesh: stop heartbeats, end every session, close the interface
    pub fn stop(&self) {
        self.rendezvous.stop();
        self.connector.stop();
        self.router.stop();
        self.transport.close();
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn inside_address(&self) -> IpAddr {
        self.inside_address
    }

    /// Local address of the multiplexed socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Our address as seen by the rendezvous, once known
    pub fn outside_addr(&self) -> Option<SocketAddr> {
        self.connector.outside_addr()
    }

    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.registry.sessions()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::packet_pipe;
    use crate::interface::testing::ipv4_packet;
    use crate::rendezvous::RendezvousServer;
    use tokio::time::timeout;

    fn options(inside: &str, rendezvous: SocketAddr) -> MemberOptions {
        let transport = TransportConfig {
            handshake_timeout_ms: 2000,
            retransmit_interval_ms: 50,
            probe_drain_timeout_ms: 50,
            ..TransportConfig::default()
        };
        MemberOptions {
            network_name: "testNet".into(),
            psk: b"mesh secret".to_vec(),
            inside_address: inside.parse().unwrap(),
            rendezvous,
            bind_address: "127.0.0.1:0".parse().unwrap(),
            heartbeat_interval: Duration::from_millis(100),
            transport,
        }
    }

    async fn wait_for_peer(member: &MeshMember, inside: &str) {
        let inside: IpAddr = inside.parse().unwrap();
        timeout(Duration::from_secs(5), async {
            while member.registry().get_by_inside(&inside).is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_two_members_exchange_packets() {
        let server = Arc::new(
            RendezvousServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                Duration::from_millis(100),
                Duration::from_secs(5),
            )
            .await
            .unwrap(),
        );
        let rendezvous = server.local_addr().unwrap();
        tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        let (pipe1, host1) = packet_pipe(16);
        let (pipe2, host2) = packet_pipe(16);
        let member1 = Arc::new(MeshMember::new(Arc::new(pipe1), options("192.168.52.1", rendezvous)).await.unwrap());
        let member2 = Arc::new(MeshMember::new(Arc::new(pipe2), options("192.168.52.2", rendezvous)).await.unwrap());

        for member in [&member1, &member2] {
            let member = Arc::clone(member);
            tokio::spawn(async move { member.run().await });
        }

        wait_for_peer(&member1, "192.168.52.2").await;
        wait_for_peer(&member2, "192.168.52.1").await;

        let packet = ipv4_packet([192, 168, 52, 1], [192, 168, 52, 2], b"hello through the mesh");
        host1.inject(&packet).await.unwrap();
        let delivered = timeout(Duration::from_secs(2), host2.next_packet()).await.unwrap().unwrap();
        assert_eq!(&delivered[..], &packet[..]);

        let reply = ipv4_packet([192, 168, 52, 2], [192, 168, 52, 1], b"and back");
        host2.inject(&reply).await.unwrap();
        let delivered = timeout(Duration::from_secs(2), host1.next_packet()).await.unwrap().unwrap();
        assert_eq!(&delivered[..], &reply[..]);

        assert_eq!(member1.outside_addr(), Some(member1.local_addr().unwrap()));
        assert_eq!(server.members("testNet").len(), 2);

        member1.stop();
        member2.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_wrong_key_never_connects() {
        let server = Arc::new(
            RendezvousServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                Duration::from_millis(100),
                Duration::from_secs(5),
            )
            .await
            .unwrap(),
        );
        let rendezvous = server.local_addr().unwrap();
        tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        let mut stranger_options = options("192.168.52.9", rendezvous);
        stranger_options.psk = b"not the mesh secret".to_vec();

        let (pipe1, _host1) = packet_pipe(16);
        let (pipe2, _host2) = packet_pipe(16);
        let member = Arc::new(MeshMember::new(Arc::new(pipe1), options("192.168.52.1", rendezvous)).await.unwrap());
        let stranger = Arc::new(MeshMember::new(Arc::new(pipe2), stranger_options).await.unwrap());

        for member in [&member, &stranger] {
            let member = Arc::clone(member);
            tokio::spawn(async move { member.run().await });
        }

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(server.members("testNet").len(), 2);
        assert!(member.peers().is_empty());
        assert!(stranger.peers().is_empty());

        member.stop();
        stranger.stop();
        server.stop();
    }

    #[tokio::test]
    async fn test_options_from_config() {
        let config = WolfMeshConfig::from_str(
            r#"
[member]
network_name = "lab"
psk = "secret"
rendezvous_address = "127.0.0.1:12345"
bind_address = "127.0.0.1:0"

[interface]
address = "10.9.0.4/24"
"#,
        )
        .unwrap();

        let options = MemberOptions::from_config(&config).await.unwrap();
        assert_eq!(options.network_name, "lab");
        assert_eq!(options.inside_address, "10.9.0.4".parse::<IpAddr>().unwrap());
        assert_eq!(options.rendezvous, "127.0.0.1:12345".parse::<SocketAddr>().unwrap());
        assert_eq!(options.psk, b"secret");
    }
}
