//! Rendezvous wire messages
//!
//! Both messages travel as JSON text in a single UDP datagram so they stay
//! human-inspectable with tcpdump.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Largest datagram either side will read
pub const MAX_DATAGRAM: usize = 65535;

/// Member -> rendezvous keepalive naming the mesh the member belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(alias = "networkName")]
    pub network_name: String,
}

impl Heartbeat {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self { network_name: network_name.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let heartbeat: Heartbeat = serde_json::from_slice(data)?;
        if heartbeat.network_name.is_empty() {
            return Err(Error::MalformedMessage("empty network name".into()));
        }
        Ok(heartbeat)
    }
}

/// Rendezvous -> member snapshot of every live member of one mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    /// Outside addresses of all current members
    pub addresses: Vec<SocketAddr>,
    /// Position of the recipient in `addresses`
    pub your_index: usize,
}

impl NetworkMap {
    pub fn new(addresses: Vec<SocketAddr>, your_index: usize) -> Self {
        Self { addresses, your_index }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check that `your_index` points into `addresses`
    pub fn decode(data: &[u8]) -> Result<Self> {
        let map: NetworkMap = serde_json::from_slice(data)?;
        if map.your_index >= map.addresses.len() {
            return Err(Error::MalformedMessage(format!(
                "your_index {} out of range for {} addresses",
                map.your_index,
                map.addresses.len()
            )));
        }
        Ok(map)
    }

    /// The recipient's own outside address
    pub fn me(&self) -> Option<SocketAddr> {
        self.addresses.get(self.your_index).copied()
    }

    /// Every member except the recipient
    pub fn others(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        let me = self.me();
        self.addresses.iter().copied().filter(move |addr| Some(*addr) != me)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addresses.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_format() {
        let encoded = Heartbeat::new("testNet").encode().unwrap();
        assert_eq!(encoded, br#"{"network_name":"testNet"}"#);

        let decoded = Heartbeat::decode(br#"{"networkName": "test"}"#).unwrap();
        assert_eq!(decoded.network_name, "test");
    }

    #[test]
    fn test_heartbeat_rejects_garbage() {
        assert!(Heartbeat::decode(b"hello").is_err());
        assert!(Heartbeat::decode(br#"{"network_name": ""}"#).is_err());
        assert!(Heartbeat::decode(br#"{"other": 1}"#).is_err());
    }

    #[test]
    fn test_network_map_decode() {
        let map = NetworkMap::decode(
            br#"{ "addresses": ["192.168.4.1:2000", "[2001:db8::1]:3000"], "your_index": 1 }"#,
        )
        .unwrap();

        assert_eq!(map.addresses.len(), 2);
        assert_eq!(map.me(), Some("[2001:db8::1]:3000".parse().unwrap()));
        let others: Vec<_> = map.others().collect();
        assert_eq!(others, vec!["192.168.4.1:2000".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_network_map_index_out_of_range() {
        let err = NetworkMap::decode(br#"{ "addresses": ["10.0.0.1:1"], "your_index": 1 }"#);
        assert!(matches!(err, Err(Error::MalformedMessage(_))));

        let err = NetworkMap::decode(br#"{ "addresses": [], "your_index": 0 }"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_network_map_is_text() {
        let map = NetworkMap::new(vec!["127.0.0.1:5000".parse().unwrap()], 0);
        let text = String::from_utf8(map.encode().unwrap()).unwrap();
        assert!(text.contains("127.0.0.1:5000"));
        assert!(text.contains("your_index"));
    }
}
