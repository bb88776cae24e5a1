//! Peer transport
//!
//! A single UDP socket per member, demultiplexed into plain datagram
//! connections (rendezvous, probes) and PSK-authenticated encrypted
//! sessions with other members.

pub mod crypto;
pub mod mux;
pub mod record;
pub mod session;

pub use mux::{DatagramConn, DatagramReceiver, DatagramSender, MultiplexedConn, PROBE_PAYLOAD};
pub use record::{classify, DatagramKind};
pub use session::{SecureReader, SecureSession, SecureWriter, SessionConfig, Side};
