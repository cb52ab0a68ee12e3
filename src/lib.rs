//! Chainmesh - a peer-to-peer node for a network of independent ledgers
//!
//! Every participant may own any number of append-only chains, each signed by
//! its own key. Nodes exchange new blocks by gossip and fetch missing ranges
//! from each other over persistent TCP connections.

pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod factory;
pub mod network;
pub mod node;
pub mod sentence;
pub mod share;
pub mod storage;
pub mod utils;

// Re-exports
pub use chain::{Block, Blockchain, ChainInfo, ChainRecord, Ledger};
pub use config::{NodeConfig, PeersConfig};
pub use crypto::Identity;
pub use error::{ChainmeshError, Result};
pub use factory::SentenceFactory;
pub use network::{Message, MessageType, PeerAddress, PeerRecord, PeerSummary};
pub use node::{AdminCommand, AdminResponse, ChainNode, ChainNodeBuilder};
pub use sentence::Sentence;
pub use share::ShareManager;
pub use storage::{MemoryRepository, Repository};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Version announced in INFO sentences
pub const PROTOCOL_VERSION: &str = "0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 32767;

/// Maximum number of inbound peers by default
pub const DEFAULT_MAX_PEERS: usize = 50;

/// Reconnection attempts toward a lost outbound peer by default
pub const DEFAULT_RETRY: u32 = 5;

/// Largest block payload accepted when creating a block
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Cumulative block size cap of one BLOCKS answer page
pub const BLOCKS_PAGE_LIMIT: usize = 1024 * 1024 * 3 / 2;
