//! Building and interpreting sentences against the local ledger

use crate::chain::{Block, Blockchain, Ledger};
use crate::error::Result;
use crate::network::PeerAddress;
use crate::sentence::{Blocks, Info, NewBlock, Peers, WantBlocks, WantPeers};
use crate::{BLOCKS_PAGE_LIMIT, PROTOCOL_VERSION};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds sentences from local state and applies received ones
pub struct SentenceFactory {
    ledger: Arc<Ledger>,
    platform: Value,
    full_node: bool,
    page_limit: usize,
}

impl SentenceFactory {
    pub fn new(ledger: Arc<Ledger>, platform: Value, full_node: bool) -> Self {
        Self {
            ledger,
            platform,
            full_node,
            page_limit: BLOCKS_PAGE_LIMIT,
        }
    }

    /// Override the cumulative size cap of a BLOCKS page
    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Our handshake: every local chain with its height
    pub async fn info(&self) -> Result<Info> {
        let mut chains = BTreeMap::new();
        for chain in self.ledger.all_chains().await? {
            chains.insert(chain.id(), chain.height().await?);
        }
        let peers = self.ledger.repository().peers(None).await?.len() as u64;

        Ok(Info {
            version: PROTOCOL_VERSION.to_string(),
            peers,
            chains,
            platform: self.platform.clone(),
            full_node: self.full_node,
        })
    }

    pub fn want_blocks(chain_id: impl Into<String>, from: u64, to: u64) -> WantBlocks {
        WantBlocks {
            chain_id: chain_id.into(),
            from,
            to,
        }
    }

    /// Range we are missing of a chain the remote holds at `remote_height`
    async fn want_for(&self, chain_id: &str, remote_height: u64) -> Result<Option<WantBlocks>> {
        let local_height = match self.ledger.load(chain_id).await? {
            Some(chain) => chain.height().await?,
            None => 0,
        };
        if local_height < remote_height {
            Ok(Some(Self::want_blocks(chain_id, local_height, remote_height - 1)))
        } else {
            Ok(None)
        }
    }

    /// One request per chain the remote is ahead on
    pub async fn want_blocks_for_info(&self, info: &Info) -> Result<Vec<WantBlocks>> {
        let mut wants = Vec::new();
        for (chain_id, height) in &info.chains {
            if let Some(want) = self.want_for(chain_id, *height).await? {
                wants.push(want);
            }
        }
        Ok(wants)
    }

    pub async fn want_blocks_for_new_block(&self, new_block: &NewBlock) -> Result<Option<WantBlocks>> {
        self.want_for(&new_block.chain_id, new_block.height).await
    }

    pub fn want_peers_for_info(info: &Info) -> Option<WantPeers> {
        (info.peers > 0).then_some(WantPeers { count: info.peers })
    }

    pub async fn new_block(chain: &Blockchain) -> Result<NewBlock> {
        Ok(NewBlock {
            chain_id: chain.id(),
            height: chain.height().await?,
        })
    }

    /// Answer pages for a block request, or `None` for an unknown chain
    pub async fn send_blocks(&self, want: &WantBlocks) -> Result<Option<Vec<Blocks>>> {
        let Some(chain) = self.ledger.load(&want.chain_id).await? else {
            return Ok(None);
        };
        let blocks = chain.get_blocks(want.from, want.to).await?;
        Ok(Some(paginate(blocks, self.page_limit)))
    }

    /// Up to `want.count` directory entries, never the requester itself
    pub async fn send_peers(&self, want: &WantPeers, requester: &PeerAddress) -> Result<Peers> {
        let limit = usize::try_from(want.count).unwrap_or(usize::MAX);
        let peers = self
            .ledger
            .repository()
            .peers(None)
            .await?
            .into_iter()
            .filter(|peer| peer.address != requester.address)
            .take(limit)
            .collect();
        Ok(Peers { peers })
    }

    /// Merge received entries into the directory
    pub async fn handle_peers(&self, peers: &Peers) -> Result<usize> {
        for peer in &peers.peers {
            self.ledger.repository().upsert_peer(peer.clone()).await?;
        }
        Ok(peers.peers.len())
    }

    /// Store every acceptable block of a page; returns how many were saved
    ///
    /// Each block stands alone: a refused block does not stop the rest.
    pub async fn handle_blocks(&self, page: &Blocks) -> Result<usize> {
        let mut saved = 0;
        for block in &page.blocks {
            if self.ledger.accept_block(block).await? {
                saved += 1;
            } else {
                debug!(chain_id = %block.chain_id, height = block.height, "Block refused");
            }
        }
        if saved > 0 {
            info!("Saved {} of {} received blocks", saved, page.blocks.len());
        }
        Ok(saved)
    }
}

/// Split `blocks` into pages whose cumulative size stays within `limit`
///
/// A block larger than `limit` gets a page of its own. Only the last page is
/// marked `end`; an empty range still yields one (empty) final page.
pub fn paginate(blocks: Vec<Block>, limit: usize) -> Vec<Blocks> {
    let mut pages = Vec::new();
    let mut current = Vec::new();
    let mut size = 0;

    for block in blocks {
        let block_size = block.size();
        if !current.is_empty() && size + block_size > limit {
            pages.push(Blocks {
                blocks: std::mem::take(&mut current),
                end: false,
            });
            size = 0;
        }
        size += block_size;
        current.push(block);
    }

    pages.push(Blocks {
        blocks: current,
        end: true,
    });
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, payload_len: usize) -> Block {
        Block {
            hash: format!("h{}", height),
            prev_hash: String::new(),
            time: 0,
            signature: "s".into(),
            chain_id: "c".into(),
            height,
            payload: vec![b'x'; payload_len],
        }
    }

    #[test]
    fn test_paginate_respects_limit() {
        let blocks: Vec<Block> = (0..10).map(|h| block(h, 100)).collect();
        let size = blocks[0].size();
        let pages = paginate(blocks.clone(), size * 3);

        assert_eq!(pages.len(), 4);
        assert!(pages[..3].iter().all(|page| !page.end && page.blocks.len() == 3));
        assert!(pages[3].end);

        let joined: Vec<Block> = pages.into_iter().flat_map(|page| page.blocks).collect();
        assert_eq!(joined, blocks);
    }

    #[test]
    fn test_paginate_oversized_block_alone() {
        let pages = paginate(vec![block(0, 10), block(1, 5000), block(2, 10)], 1000);
        let heights: Vec<Vec<u64>> = pages
            .iter()
            .map(|page| page.blocks.iter().map(|b| b.height).collect())
            .collect();
        assert_eq!(heights, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_paginate_empty_range() {
        let pages = paginate(Vec::new(), 1000);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].end && pages[0].blocks.is_empty());
    }
}
