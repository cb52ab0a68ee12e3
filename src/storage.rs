//! Repository interface for chains, blocks and the peer directory

use crate::chain::{Block, ChainRecord};
use crate::error::Result;
use crate::network::PeerRecord;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Persistence consumed by the ledger and the gossip layer
///
/// Implementations arbitrate concurrent writes: `insert_block` must refuse a
/// second block at an occupied height.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRecord>>;
    /// Returns `false` when a record with the same public key exists
    async fn save_chain(&self, chain: ChainRecord) -> Result<bool>;
    async fn all_chains(&self) -> Result<Vec<ChainRecord>>;

    async fn get_block(&self, chain_id: &str, height: u64) -> Result<Option<Block>>;
    async fn get_block_by_hash(&self, chain_id: &str, hash: &str) -> Result<Option<Block>>;
    /// Returns `false` when the height is already occupied
    async fn insert_block(&self, block: Block) -> Result<bool>;
    async fn get_height(&self, chain_id: &str) -> Result<u64>;
    /// Blocks in `start..=end`, ascending by height
    async fn get_blocks(&self, chain_id: &str, start: u64, end: u64) -> Result<Vec<Block>>;

    async fn get_peer(&self, address: &str) -> Result<Option<PeerRecord>>;
    /// Insert or replace the entry keyed on `address`
    async fn upsert_peer(&self, peer: PeerRecord) -> Result<()>;
    /// Directory entries, highest rank first
    async fn peers(&self, limit: Option<usize>) -> Result<Vec<PeerRecord>>;

    async fn initialize(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    chains: HashMap<String, ChainRecord>,
    blocks: HashMap<String, BTreeMap<u64, Block>>,
    peers: HashMap<String, PeerRecord>,
}

/// In-memory repository implementation
#[derive(Debug, Default)]
pub struct MemoryRepository {
    data: tokio::sync::RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_chain(&self, chain_id: &str) -> Result<Option<ChainRecord>> {
        let data = self.data.read().await;
        Ok(data.chains.get(chain_id).cloned())
    }

    async fn save_chain(&self, chain: ChainRecord) -> Result<bool> {
        let mut data = self.data.write().await;
        if data.chains.contains_key(&chain.public_key) {
            return Ok(false);
        }
        data.chains.insert(chain.public_key.clone(), chain);
        Ok(true)
    }

    async fn all_chains(&self) -> Result<Vec<ChainRecord>> {
        let data = self.data.read().await;
        let mut chains: Vec<ChainRecord> = data.chains.values().cloned().collect();
        chains.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(chains)
    }

    async fn get_block(&self, chain_id: &str, height: u64) -> Result<Option<Block>> {
        let data = self.data.read().await;
        Ok(data
            .blocks
            .get(chain_id)
            .and_then(|blocks| blocks.get(&height))
            .cloned())
    }

    async fn get_block_by_hash(&self, chain_id: &str, hash: &str) -> Result<Option<Block>> {
        let data = self.data.read().await;
        Ok(data
            .blocks
            .get(chain_id)
            .and_then(|blocks| blocks.values().find(|block| block.hash == hash))
            .cloned())
    }

    async fn insert_block(&self, block: Block) -> Result<bool> {
        let mut data = self.data.write().await;
        let blocks = data.blocks.entry(block.chain_id.clone()).or_default();
        if blocks.contains_key(&block.height) {
            return Ok(false);
        }
        blocks.insert(block.height, block);
        Ok(true)
    }

    async fn get_height(&self, chain_id: &str) -> Result<u64> {
        let data = self.data.read().await;
        Ok(data
            .blocks
            .get(chain_id)
            .map(|blocks| blocks.len() as u64)
            .unwrap_or(0))
    }

    async fn get_blocks(&self, chain_id: &str, start: u64, end: u64) -> Result<Vec<Block>> {
        if start > end {
            return Ok(Vec::new());
        }
        let data = self.data.read().await;
        Ok(data
            .blocks
            .get(chain_id)
            .map(|blocks| blocks.range(start..=end).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_peer(&self, address: &str) -> Result<Option<PeerRecord>> {
        let data = self.data.read().await;
        Ok(data.peers.get(address).cloned())
    }

    async fn upsert_peer(&self, peer: PeerRecord) -> Result<()> {
        let mut data = self.data.write().await;
        data.peers.insert(peer.address.clone(), peer);
        Ok(())
    }

    async fn peers(&self, limit: Option<usize>) -> Result<Vec<PeerRecord>> {
        let data = self.data.read().await;
        let mut peers: Vec<PeerRecord> = data.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.address.cmp(&b.address)));
        if let Some(limit) = limit {
            peers.truncate(limit);
        }
        Ok(peers)
    }

    async fn initialize(&self) -> Result<()> {
        // In-memory storage doesn't need initialization
        Ok(())
    }
}
