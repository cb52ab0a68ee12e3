//! Node configuration

use crate::error::{ChainmeshError, Result};
use crate::{BLOCKS_PAGE_LIMIT, DEFAULT_MAX_PEERS, DEFAULT_PORT, DEFAULT_RETRY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Peer directory behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Ask peers for their directories after a handshake
    pub sync: bool,
    /// Reconnection attempts toward a lost outbound peer
    pub retry: u32,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            sync: true,
            retry: DEFAULT_RETRY,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listen address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// Address other nodes know us by; never dialled
    pub advertised_address: Option<String>,

    /// Inbound connections beyond this are closed
    pub max_peers: usize,

    pub peers: PeersConfig,

    pub connect_timeout_ms: u64,

    /// Longest wait for each page of a correlated answer sequence
    pub answer_timeout_ms: u64,

    /// Broadcast identifiers remembered for deduplication
    pub broadcast_cache_size: usize,

    /// Cumulative block size cap of one BLOCKS answer page
    pub blocks_page_limit: usize,

    pub full_node: bool,

    /// Free-form description sent in INFO
    pub platform: Value,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            advertised_address: None,
            max_peers: DEFAULT_MAX_PEERS,
            peers: PeersConfig::default(),
            connect_timeout_ms: 5_000,
            answer_timeout_ms: 30_000,
            broadcast_cache_size: 10_000,
            blocks_page_limit: BLOCKS_PAGE_LIMIT,
            full_node: true,
            platform: default_platform(),
        }
    }
}

fn default_platform() -> Value {
    serde_json::json!({
        "name": crate::NAME,
        "version": crate::VERSION,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

impl NodeConfig {
    /// Read a JSON file; absent keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ChainmeshError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    /// Whether `address:port` is this node
    pub fn is_self(&self, address: &str, port: u16) -> bool {
        if port != self.port {
            return false;
        }
        match self.advertised_address.as_deref() {
            Some(advertised) => advertised == address,
            None => matches!(address, "127.0.0.1" | "localhost" | "::1") || address == self.host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 32767);
        assert_eq!(config.peers.retry, 5);
        assert!(config.peers.sync);
        assert_eq!(config.answer_timeout(), Duration::from_secs(30));
        assert_eq!(config.blocks_page_limit, BLOCKS_PAGE_LIMIT);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"port": 4000, "peers": {"retry": 2}}"#).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.peers.retry, 2);
        assert!(config.peers.sync);
        assert_eq!(config.max_peers, DEFAULT_MAX_PEERS);
    }

    #[test]
    fn test_is_self() {
        let mut config = NodeConfig {
            port: 4000,
            ..Default::default()
        };
        assert!(config.is_self("127.0.0.1", 4000));
        assert!(!config.is_self("127.0.0.1", 4001));

        config.advertised_address = Some("203.0.113.7".into());
        assert!(config.is_self("203.0.113.7", 4000));
        assert!(!config.is_self("127.0.0.1", 4000));
    }
}
