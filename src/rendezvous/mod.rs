//! Rendezvous service and client
//!
//! The rendezvous is the only fixed point of a mesh: members heartbeat to
//! it and learn each other's outside addresses from its broadcasts.

pub mod client;
pub mod server;

pub use client::{NetworkMapCallback, RendezvousClient};
pub use server::{MeshNetwork, RendezvousServer};
