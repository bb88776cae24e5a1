//! Peer management
//!
//! Sessions with other mesh members, the registry that indexes them by
//! inside and outside address, and the connector that turns network map
//! updates into new sessions.

pub mod connector;
pub mod registry;
pub mod session;

pub use connector::{negotiate_role, ConnectorOptions, PeerConnector, Role};
pub use registry::PeerRegistry;
pub use session::{PeerSession, PeerStats};

use std::time::Duration;

/// What `PeerSession::queue` does when the outgoing queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the packet that does not fit
    DropNewest,
    /// Wait for space up to the given budget, then drop
    Block(Duration),
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropNewest
    }
}
