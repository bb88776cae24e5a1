//! WolfMesh Error Types

use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    // Wire message errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message encoding error: {0}")]
    Json(#[from] serde_json::Error),

    // Session errors
    #[error("Handshake with {address} failed: {reason}")]
    Handshake { address: SocketAddr, reason: String },

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("Authentication failed for {0}")]
    Authentication(SocketAddr),

    #[error("Invalid identity hint from {address}: {hint:?}")]
    IdentityHint { address: SocketAddr, hint: String },

    #[error("Peer {0} reset the session")]
    SessionReset(SocketAddr),

    #[error("Record rejected: {0}")]
    Record(String),

    // Transport errors
    #[error("Transport closed")]
    TransportClosed,

    #[error("Connection to {0} closed")]
    ConnectionClosed(SocketAddr),

    #[error("Route to {0} already in use")]
    RouteInUse(SocketAddr),

    // Routing errors
    #[error("Virtual interface closed")]
    InterfaceClosed,

    #[error("Outgoing queue for {0} is full")]
    QueueFull(SocketAddr),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is transient (the loop that hit it should carry on)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
            ),
            Error::HandshakeTimeout(_) | Error::QueueFull(_) | Error::Record(_) => true,
            _ => false,
        }
    }

    /// Check if this error means the underlying socket/interface is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed
                | Error::ConnectionClosed(_)
                | Error::InterfaceClosed
                | Error::SessionReset(_)
                | Error::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        assert!(Error::HandshakeTimeout(addr).is_transient());
        assert!(Error::Io(std::io::ErrorKind::TimedOut.into()).is_transient());
        assert!(!Error::Authentication(addr).is_transient());

        assert!(Error::ConnectionClosed(addr).is_closed());
        assert!(Error::InterfaceClosed.is_closed());
        assert!(!Error::MalformedMessage("x".into()).is_closed());
    }
}
