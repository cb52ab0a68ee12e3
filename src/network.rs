//! Networking module for peer-to-peer communication

pub mod dispatcher;
pub mod message;
pub mod peer;
pub mod server;

use crate::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use dispatcher::{Dispatcher, GlobalHandler, Handler};
pub use message::{Message, MessageType};
pub use peer::{Answers, PeerEvent, PeerHandle};
pub use server::Server;

/// Rank given to peers we know nothing about
pub const DEFAULT_RANK: i64 = 100;

fn default_rank() -> i64 {
    DEFAULT_RANK
}

/// Peer directory entry, as persisted and as exchanged in PEERS answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_rank")]
    pub rank: i64,
}

impl PeerRecord {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            rank: DEFAULT_RANK,
        }
    }

    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress::new(self.address.clone(), self.port)
    }
}

/// Identity of a peer for set membership: `(address, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub address: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidAddress {
            addr: s.to_string(),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// We dialled the peer (it is a "server" to us)
    Outbound,
    /// The peer dialled us (it is a "client" to us)
    Inbound,
}

/// Snapshot of a live peer for administrative listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub address: String,
    pub port: u16,
    pub rank: i64,
    pub direction: Direction,
}

impl fmt::Display for PeerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.direction {
            Direction::Outbound => "server",
            Direction::Inbound => "client",
        };
        write!(
            f,
            "<Peer: {}:{} ({}, rank: {})>",
            self.address, self.port, side, self.rank
        )
    }
}
