//! Chainmesh node implementation

use crate::{
    chain::{Block, Blockchain, ChainInfo, Ledger},
    config::NodeConfig,
    error::{ChainmeshError, CryptoError, Result, StorageError},
    factory::SentenceFactory,
    network::{PeerAddress, PeerEvent, PeerRecord, PeerSummary, Server},
    share::ShareManager,
    storage::{MemoryRepository, Repository},
    utils::random_payload,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Administrative operations, as issued by an operator or RPC layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminCommand {
    CreateChain {
        metadata: Map<String, Value>,
    },
    /// Append to `chain_id`, or to the first owned chain
    CreateBlock {
        chain_id: Option<String>,
        payload: Vec<u8>,
    },
    /// Append `count` blocks of `size` random bytes
    CreateBlocks {
        chain_id: Option<String>,
        count: usize,
        size: usize,
    },
    ListPeers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum AdminResponse {
    Chain(ChainInfo),
    Block(Block),
    Blocks(Vec<Block>),
    Peers(Vec<PeerSummary>),
}

/// Main node structure
pub struct ChainNode {
    config: NodeConfig,
    repository: Arc<dyn Repository>,
    ledger: Arc<Ledger>,
    share: Arc<ShareManager>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    seeds: Vec<PeerAddress>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChainNode {
    /// Create a node with an in-memory repository and default settings
    pub fn new_default() -> Self {
        Self::new(NodeConfig::default(), Arc::new(MemoryRepository::new()))
    }

    pub fn new(config: NodeConfig, repository: Arc<dyn Repository>) -> Self {
        let ledger = Arc::new(Ledger::new(repository.clone()));
        let factory =
            SentenceFactory::new(ledger.clone(), config.platform.clone(), config.full_node)
                .with_page_limit(config.blocks_page_limit);
        let (share, events) = ShareManager::new(factory, config.clone());

        Self {
            config,
            repository,
            ledger,
            share,
            events: Some(events),
            seeds: Vec::new(),
            local_addr: None,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Create a builder for this node
    pub fn builder() -> ChainNodeBuilder {
        ChainNodeBuilder::new()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn share(&self) -> &Arc<ShareManager> {
        &self.share
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Bind the listener, start gossiping and dial the peer directory
    ///
    /// A stopped node cannot be started again.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let events = self
            .events
            .take()
            .ok_or_else(|| ChainmeshError::generic("node has already been started"))?;

        self.repository.initialize().await?;

        let server = Server::bind(&self.config.host, self.config.port).await?;
        let addr = server.local_addr()?;
        self.local_addr = Some(addr);

        let shutdown = CancellationToken::new();
        self.tasks.push(tokio::spawn(
            server.run(self.share.events(), shutdown.child_token()),
        ));
        self.tasks.push(tokio::spawn(
            self.share.clone().run(events, shutdown.child_token()),
        ));
        self.shutdown = Some(shutdown);

        for seed in std::mem::take(&mut self.seeds) {
            self.remember_peer(&seed).await?;
        }
        for record in self.repository.peers(None).await? {
            if self.is_self(&record) {
                continue;
            }
            self.share.connect(record).await;
        }

        info!("Node started on {}", addr);
        Ok(())
    }

    /// Stop listening and close every connection
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        info!("Node stopped");
        Ok(())
    }

    fn is_self(&self, record: &PeerRecord) -> bool {
        let port = self.local_addr.map(|addr| addr.port()).unwrap_or(self.config.port);
        NodeConfig {
            port,
            ..self.config.clone()
        }
        .is_self(&record.address, record.port)
    }

    /// Add `address` to the peer directory, keeping a known rank
    async fn remember_peer(&self, address: &PeerAddress) -> Result<PeerRecord> {
        let mut record = PeerRecord::new(address.address.clone(), address.port);
        if let Some(known) = self.repository.get_peer(&address.address).await? {
            record.rank = known.rank;
        }
        self.repository.upsert_peer(record.clone()).await?;
        Ok(record)
    }

    /// Add a seed peer; dialled now if the node is running
    pub async fn add_peer(&mut self, address: &str) -> Result<()> {
        let address: PeerAddress = address.parse()?;
        if !self.is_running() {
            self.seeds.push(address);
            return Ok(());
        }
        let record = self.remember_peer(&address).await?;
        if !self.is_self(&record) {
            self.share.connect(record).await;
        }
        Ok(())
    }

    /// Create an owned chain and return its info
    pub async fn create_chain(&self, metadata: Map<String, Value>) -> Result<ChainInfo> {
        let chain = self.ledger.create_chain(metadata).await?;
        chain
            .info()
            .await?
            .ok_or_else(|| ChainmeshError::generic("chain has no genesis block"))
    }

    async fn owned_chain(&self, chain_id: Option<&str>) -> Result<Blockchain> {
        let chain = match chain_id {
            Some(chain_id) => self.ledger.load(chain_id).await?.ok_or_else(|| {
                StorageError::KeyNotFound {
                    key: chain_id.to_string(),
                }
            })?,
            None => self
                .ledger
                .owned_chains()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ChainmeshError::generic("no owned chain"))?,
        };
        if !chain.is_owner() {
            return Err(CryptoError::MissingPrivateKey {
                public_key: chain.id(),
            }
            .into());
        }
        Ok(chain)
    }

    /// Append a block to an owned chain and announce it
    pub async fn create_block(&self, chain_id: Option<&str>, payload: Vec<u8>) -> Result<Block> {
        let chain = self.owned_chain(chain_id).await?;
        let block = self.ledger.append(&chain, payload).await?;
        info!(chain_id = %block.chain_id, height = block.height, "Block created");
        self.share.announce(&chain).await?;
        Ok(block)
    }

    /// Append `count` blocks of random payload, announcing the final head once
    pub async fn create_blocks(
        &self,
        chain_id: Option<&str>,
        count: usize,
        size: usize,
    ) -> Result<Vec<Block>> {
        let chain = self.owned_chain(chain_id).await?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(self.ledger.append(&chain, random_payload(size)).await?);
        }
        if !blocks.is_empty() {
            info!(chain_id = %chain.id(), count, "Blocks created");
            self.share.announce(&chain).await?;
        }
        Ok(blocks)
    }

    pub async fn list_peers(&self) -> Vec<PeerSummary> {
        self.share.active_peers().await
    }

    pub async fn execute(&self, command: AdminCommand) -> Result<AdminResponse> {
        match command {
            AdminCommand::CreateChain { metadata } => {
                self.create_chain(metadata).await.map(AdminResponse::Chain)
            },
            AdminCommand::CreateBlock { chain_id, payload } => self
                .create_block(chain_id.as_deref(), payload)
                .await
                .map(AdminResponse::Block),
            AdminCommand::CreateBlocks {
                chain_id,
                count,
                size,
            } => self
                .create_blocks(chain_id.as_deref(), count, size)
                .await
                .map(AdminResponse::Blocks),
            AdminCommand::ListPeers => Ok(AdminResponse::Peers(self.list_peers().await)),
        }
    }
}

/// Builder for chainmesh nodes
pub struct ChainNodeBuilder {
    repository: Option<Arc<dyn Repository>>,
    config: NodeConfig,
    seeds: Vec<String>,
}

impl ChainNodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self {
            repository: None,
            config: NodeConfig::default(),
            seeds: Vec::new(),
        }
    }

    /// Set the repository backend
    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the maximum peers
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.config.max_peers = max_peers;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.config.peers.retry = retry;
        self
    }

    /// Add a seed peer, as `address:port`
    pub fn peer(mut self, address: impl Into<String>) -> Self {
        self.seeds.push(address.into());
        self
    }

    /// Build the node
    pub fn build(self) -> Result<ChainNode> {
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(MemoryRepository::new()));

        let seeds = self
            .seeds
            .iter()
            .map(|seed| seed.parse::<PeerAddress>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut node = ChainNode::new(self.config, repository);
        node.seeds = seeds;
        Ok(node)
    }
}

impl Default for ChainNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
