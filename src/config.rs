//! WolfMesh Configuration
//!
//! This module provides configuration structures for the rendezvous
//! service and for mesh members.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::peer::OverflowPolicy;

/// Main WolfMesh configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfMeshConfig {
    /// Rendezvous service configuration
    #[serde(default)]
    pub rendezvous: RendezvousConfig,

    /// Mesh member configuration
    #[serde(default)]
    pub member: MemberConfig,

    /// Virtual interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Peer transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rendezvous service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// UDP address to listen on for heartbeats
    #[serde(default = "default_rendezvous_bind")]
    pub bind_address: String,

    /// How often every network's membership is broadcast
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    /// Members silent for longer than this are evicted
    #[serde(default = "default_member_timeout_secs")]
    pub member_timeout_secs: u64,
}

/// Mesh member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Name of the mesh network to join
    #[serde(default)]
    pub network_name: String,

    /// Pre-shared key shared by every member of the mesh
    #[serde(default)]
    pub psk: String,

    /// Rendezvous service address (host:port)
    #[serde(default = "default_rendezvous_address")]
    pub rendezvous_address: String,

    /// Local UDP address for the multiplexed peer socket
    #[serde(default = "default_member_bind")]
    pub bind_address: String,

    /// Heartbeat interval towards the rendezvous service
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

/// Virtual interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// TUN interface name
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// This member's inside address with prefix length (e.g. "192.168.50.2/24")
    #[serde(default = "default_interface_address")]
    pub address: String,

    /// MTU for the TUN interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// What to do when a peer's outgoing queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    /// Drop the packet that does not fit
    DropNewest,
    /// Wait up to `block_timeout_ms`, then drop
    Block,
}

/// Peer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Give up on a handshake after this long
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Handshake retransmit interval
    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,

    /// How long a dialling member waits for the peer's priming probe
    #[serde(default = "default_probe_drain_timeout_ms")]
    pub probe_drain_timeout_ms: u64,

    /// Packets buffered per peer before the overflow policy applies
    #[serde(default = "default_queue_capacity")]
    pub outgoing_queue_capacity: usize,

    /// Overflow policy for the per-peer queue
    #[serde(default = "default_overflow")]
    pub overflow: OverflowMode,

    /// Wait budget for `overflow = "block"`
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_rendezvous_bind() -> String {
    "0.0.0.0:12345".to_string()
}

fn default_broadcast_interval_ms() -> u64 {
    5000
}

fn default_member_timeout_secs() -> u64 {
    30
}

fn default_rendezvous_address() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_member_bind() -> String {
    "0.0.0.0:0".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_interface_name() -> String {
    "wolfmesh0".to_string()
}

fn default_interface_address() -> String {
    "192.168.50.1/24".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_retransmit_interval_ms() -> u64 {
    500
}

fn default_probe_drain_timeout_ms() -> u64 {
    250
}

fn default_queue_capacity() -> usize {
    256
}

fn default_overflow() -> OverflowMode {
    OverflowMode::DropNewest
}

fn default_block_timeout_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind_address: default_rendezvous_bind(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            member_timeout_secs: default_member_timeout_secs(),
        }
    }
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            network_name: String::new(),
            psk: String::new(),
            rendezvous_address: default_rendezvous_address(),
            bind_address: default_member_bind(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            address: default_interface_address(),
            mtu: default_mtu(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
            probe_drain_timeout_ms: default_probe_drain_timeout_ms(),
            outgoing_queue_capacity: default_queue_capacity(),
            overflow: default_overflow(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl InterfaceConfig {
    /// Parse the inside address and prefix length
    pub fn inside_address(&self) -> crate::Result<(IpAddr, u8)> {
        parse_cidr(&self.address)
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn probe_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_drain_timeout_ms)
    }

    /// Overflow policy for per-peer outgoing queues
    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowMode::DropNewest => OverflowPolicy::DropNewest,
            OverflowMode::Block => {
                OverflowPolicy::Block(Duration::from_millis(self.block_timeout_ms))
            }
        }
    }
}

impl WolfMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate settings shared by every role
    pub fn validate(&self) -> crate::Result<()> {
        if self.rendezvous.broadcast_interval_ms == 0 {
            return Err(crate::Error::Config(
                "rendezvous.broadcast_interval_ms must be greater than 0".into(),
            ));
        }

        if self.rendezvous.member_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "rendezvous.member_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.member.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "member.heartbeat_interval_ms must be greater than 0".into(),
            ));
        }

        if self.transport.outgoing_queue_capacity == 0 {
            return Err(crate::Error::Config(
                "transport.outgoing_queue_capacity must be greater than 0".into(),
            ));
        }

        if self.transport.retransmit_interval_ms == 0
            || self.transport.retransmit_interval_ms > self.transport.handshake_timeout_ms
        {
            return Err(crate::Error::Config(
                "transport.retransmit_interval_ms must be between 1 and handshake_timeout_ms"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Validate the settings a mesh member cannot run without
    pub fn validate_member(&self) -> crate::Result<()> {
        self.validate()?;

        if self.member.network_name.is_empty() {
            return Err(crate::Error::Config("member.network_name cannot be empty".into()));
        }

        if self.member.psk.is_empty() {
            return Err(crate::Error::Config("member.psk cannot be empty".into()));
        }

        if self.member.rendezvous_address.is_empty() {
            return Err(crate::Error::Config(
                "member.rendezvous_address cannot be empty".into(),
            ));
        }

        self.interface.inside_address()?;

        Ok(())
    }

    /// Get broadcast interval as Duration
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.rendezvous.broadcast_interval_ms)
    }

    /// Get member timeout as Duration
    pub fn member_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous.member_timeout_secs)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.member.heartbeat_interval_ms)
    }
}

/// Parse "address/prefix" into its parts
pub fn parse_cidr(cidr: &str) -> crate::Result<(IpAddr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| crate::Error::Config(format!("{} is not in address/prefix form", cidr)))?;

    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid interface address: {}", addr)))?;

    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid prefix length: {}", prefix)))?;

    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(crate::Error::Config(format!(
            "prefix length {} exceeds {} for {}",
            prefix, max, addr
        )));
    }

    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[rendezvous]
bind_address = "0.0.0.0:12345"
broadcast_interval_ms = 1000
member_timeout_secs = 5

[member]
network_name = "home"
psk = "hunter2"
rendezvous_address = "203.0.113.7:12345"

[interface]
name = "mesh0"
address = "192.168.50.2/24"

[transport]
overflow = "block"
block_timeout_ms = 20
"#;

        let config = WolfMeshConfig::from_str(toml).unwrap();
        assert_eq!(config.member.network_name, "home");
        assert_eq!(config.broadcast_interval(), Duration::from_secs(1));
        assert_eq!(config.member_timeout(), Duration::from_secs(5));
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(
            config.transport.overflow_policy(),
            OverflowPolicy::Block(Duration::from_millis(20))
        );
        config.validate_member().unwrap();
    }

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let rendered = WolfMeshConfig::default().to_toml().unwrap();
        let parsed = WolfMeshConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.rendezvous.bind_address, "0.0.0.0:12345");
        assert_eq!(parsed.transport.overflow, OverflowMode::DropNewest);
    }

    #[test]
    fn test_member_requires_network_and_psk() {
        let config = WolfMeshConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.validate_member().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let toml = r#"
[rendezvous]
broadcast_interval_ms = 0
"#;
        assert!(WolfMeshConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let (addr, prefix) = parse_cidr("10.0.0.3/16").unwrap();
        assert_eq!(addr, "10.0.0.3".parse::<IpAddr>().unwrap());
        assert_eq!(prefix, 16);

        assert!(parse_cidr("fd00::1/64").is_ok());
        assert!(parse_cidr("10.0.0.3").is_err());
        assert!(parse_cidr("10.0.0.3/33").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[member]\nnetwork_name = \"lab\"\npsk = \"k\"").unwrap();

        let config = WolfMeshConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.member.network_name, "lab");

        let missing = WolfMeshConfig::load_or_default(Path::new("/nonexistent/wolfmesh.toml")).unwrap();
        assert!(missing.member.network_name.is_empty());
    }
}
