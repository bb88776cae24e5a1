//! WolfMesh - Peer-to-Peer Mesh VPN
//!
//! Members of a named mesh find each other through a lightweight
//! rendezvous service, punch through NAT by dialling each other directly,
//! and carry IP packets between their virtual interfaces over encrypted
//! datagram sessions.
//!
//! # Architecture
//!
//! Every member owns a single UDP socket. A multiplexer splits it into
//! logical connections per remote address: one plain connection to the
//! rendezvous and one PSK-authenticated session per peer. The rendezvous
//! broadcasts each network's membership; for every pair of members the
//! lower address dials and the higher one waits, sending a probe first so
//! its NAT lets the dial through.
//!
//! # Features
//!
//! - Rendezvous service with heartbeat liveness and periodic network maps
//! - One socket for rendezvous traffic and every peer session
//! - Pre-shared key handshake with ChaCha20-Poly1305 records
//! - Routing by inside address between a TUN device and peer sessions
//! - Bounded per-peer queues with a configurable overflow policy

pub mod config;
pub mod error;
pub mod interface;
pub mod member;
pub mod peer;
pub mod protocol;
pub mod rendezvous;
pub mod router;
pub mod transport;

pub use config::WolfMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfMeshConfig;
    pub use crate::error::{Error, Result};
    pub use crate::interface::{packet_pipe, VirtualInterface};
    pub use crate::member::{MemberOptions, MeshMember};
    pub use crate::peer::{PeerRegistry, PeerSession};
    pub use crate::protocol::{Heartbeat, NetworkMap};
    pub use crate::rendezvous::{RendezvousClient, RendezvousServer};
    pub use crate::transport::{MultiplexedConn, SecureSession, SessionConfig};
}
