//! Blocks, chains and the local ledger
//!
//! A chain is an append-only, hash-linked list of blocks signed by the key
//! whose public half is the chain id. The repository is the only source of
//! truth: chain handles re-read height and blocks on every call.

use crate::crypto::{sha256_base58, Identity};
use crate::error::{ChainmeshError, CryptoError, Result, StorageError};
use crate::storage::Repository;
use crate::utils::current_time_secs;
use crate::MAX_PAYLOAD_SIZE;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Chain metadata decoded from the genesis payload, plus `chain_id`
pub type ChainInfo = Map<String, Value>;

/// A signed, hash-linked block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prev_hash: String,
    pub time: i64,
    pub signature: String,
    pub chain_id: String,
    pub height: u64,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
}

/// Fields covered by the hash and the signature, in canonical order
#[derive(Serialize)]
struct BlockData<'a> {
    time: i64,
    chain_id: &'a str,
    height: u64,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
    prev_hash: &'a str,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    /// Canonical encoding of everything except `hash` and `signature`
    pub fn data_for_hashing(&self) -> Vec<u8> {
        let data = BlockData {
            time: self.time,
            chain_id: &self.chain_id,
            height: self.height,
            payload: &self.payload,
            prev_hash: &self.prev_hash,
        };
        // Encoding plain in-memory fields cannot fail
        bincode::serialize(&data).unwrap_or_default()
    }

    pub fn compute_hash(&self) -> String {
        sha256_base58(&self.data_for_hashing())
    }

    /// Encoded size, used to bound answer pages
    pub fn size(&self) -> usize {
        self.data_for_hashing().len() + self.hash.len() + self.signature.len()
    }

    /// Link, hash and signature check
    ///
    /// Says nothing about whether the block fits the local chain; that is
    /// decided by [`Blockchain::save_block`].
    pub fn is_valid(&self) -> bool {
        let start = Instant::now();

        let data = self.data_for_hashing();
        let linked = self.is_genesis() || !self.prev_hash.is_empty();
        let valid = linked
            && sha256_base58(&data) == self.hash
            && Identity::from_public(&self.chain_id)
                .map(|key| key.verify(&self.signature, &data))
                .unwrap_or(false);

        debug!(
            chain_id = %self.chain_id,
            height = self.height,
            valid,
            "Block validated in {:.3} secs",
            start.elapsed().as_secs_f64()
        );
        valid
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

/// Chain directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Handle on one chain, owned or remote
pub struct Blockchain {
    identity: Identity,
    repository: Arc<dyn Repository>,
    info: OnceCell<ChainInfo>,
}

impl Blockchain {
    pub fn new(identity: Identity, repository: Arc<dyn Repository>) -> Self {
        Self {
            identity,
            repository,
            info: OnceCell::new(),
        }
    }

    /// Chain id, the owner's public key
    pub fn id(&self) -> String {
        self.identity.public_key()
    }

    pub fn is_owner(&self) -> bool {
        self.identity.can_sign()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn record(&self) -> ChainRecord {
        ChainRecord {
            public_key: self.identity.public_key(),
            private_key: self.identity.private_key(),
        }
    }

    /// Number of persisted blocks
    pub async fn height(&self) -> Result<u64> {
        self.repository.get_height(&self.id()).await
    }

    /// Genesis metadata; cached once resolved
    pub async fn info(&self) -> Result<Option<ChainInfo>> {
        if let Some(info) = self.info.get() {
            return Ok(Some(info.clone()));
        }

        let Some(genesis) = self.get_block(0).await? else {
            return Ok(None);
        };

        let mut info = match serde_json::from_slice::<Value>(&genesis.payload) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(chain_id = %self.id(), "Genesis payload is not a JSON object");
                Map::new()
            },
        };
        info.insert("chain_id".to_string(), Value::String(self.id()));

        let _ = self.info.set(info.clone());
        Ok(Some(info))
    }

    pub async fn get_block(&self, height: u64) -> Result<Option<Block>> {
        self.repository.get_block(&self.id(), height).await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>> {
        self.repository.get_block_by_hash(&self.id(), hash).await
    }

    /// Blocks in `start..=end`, ascending by height
    pub async fn get_blocks(&self, start: u64, end: u64) -> Result<Vec<Block>> {
        self.repository.get_blocks(&self.id(), start, end).await
    }

    /// Build and sign the next block; nothing is written
    pub async fn create_block(&self, payload: Vec<u8>) -> Result<Block> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ChainmeshError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if !self.identity.can_sign() {
            return Err(CryptoError::MissingPrivateKey {
                public_key: self.id(),
            }
            .into());
        }

        let chain_id = self.id();
        let height = self.height().await?;
        let prev_hash = if height > 0 {
            self.get_block(height - 1)
                .await?
                .map(|block| block.hash)
                .ok_or_else(|| StorageError::KeyNotFound {
                    key: format!("{}/{}", chain_id, height - 1),
                })?
        } else {
            String::new()
        };

        let mut block = Block {
            hash: String::new(),
            prev_hash,
            time: current_time_secs(),
            signature: String::new(),
            chain_id,
            height,
            payload,
        };
        let data = block.data_for_hashing();
        block.hash = sha256_base58(&data);
        block.signature = self
            .identity
            .sign(&data)
            .ok_or_else(|| CryptoError::MissingPrivateKey {
                public_key: block.chain_id.clone(),
            })?;
        Ok(block)
    }

    /// Append `block` if it is valid and extends the current head
    ///
    /// Refusals are `Ok(false)`; only repository failures are errors.
    pub async fn save_block(&self, block: &Block) -> Result<bool> {
        if block.chain_id != self.id() || !block.is_valid() {
            return Ok(false);
        }
        if self.get_block(block.height).await?.is_some() {
            debug!(chain_id = %block.chain_id, height = block.height, "Height already occupied");
            return Ok(false);
        }

        let linked = if block.is_genesis() {
            self.height().await? == 0
        } else {
            match self.get_block(block.height - 1).await? {
                Some(prev) => prev.hash == block.prev_hash,
                None => false,
            }
        };
        if !linked {
            debug!(chain_id = %block.chain_id, height = block.height, "Block does not extend the chain");
            return Ok(false);
        }

        let start = Instant::now();
        let saved = self.repository.insert_block(block.clone()).await?;
        debug!(
            chain_id = %block.chain_id,
            height = block.height,
            "New block saved in {:.3} secs",
            start.elapsed().as_secs_f64()
        );
        Ok(saved)
    }

    /// Insert the chain directory record once
    pub async fn save(&self) -> Result<bool> {
        if self.repository.get_chain(&self.id()).await?.is_some() {
            return Ok(false);
        }
        self.repository.save_chain(self.record()).await
    }
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("id", &self.id())
            .field("owner", &self.is_owner())
            .finish()
    }
}

/// Local set of chains with single-writer-per-chain appends
pub struct Ledger {
    repository: Arc<dyn Repository>,
    writers: DashMap<String, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            writers: DashMap::new(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    fn writer(&self, chain_id: &str) -> Arc<Mutex<()>> {
        self.writers.entry(chain_id.to_string()).or_default().clone()
    }

    fn handle(&self, record: &ChainRecord) -> Result<Blockchain> {
        let identity = match record.private_key.as_deref() {
            Some(private) if !private.is_empty() => {
                Identity::from_keypair(&record.public_key, private)?
            },
            _ => Identity::from_public(&record.public_key)?,
        };
        Ok(Blockchain::new(identity, self.repository.clone()))
    }

    /// Create an owned chain whose genesis block carries `metadata`
    pub async fn create_chain(&self, metadata: Map<String, Value>) -> Result<Blockchain> {
        let chain = Blockchain::new(Identity::generate(), self.repository.clone());
        // serde_json maps are key-sorted, so this is the compact canonical form
        let payload = serde_json::to_vec(&Value::Object(metadata))?;
        let genesis = chain.create_block(payload).await?;

        let writer = self.writer(&chain.id());
        let _guard = writer.lock().await;
        chain.save().await?;
        if !chain.save_block(&genesis).await? {
            return Err(ChainmeshError::validation("genesis block was refused"));
        }

        info!(chain_id = %chain.id(), "Chain created");
        Ok(chain)
    }

    pub async fn load(&self, chain_id: &str) -> Result<Option<Blockchain>> {
        match self.repository.get_chain(chain_id).await? {
            Some(record) => Ok(Some(self.handle(&record)?)),
            None => Ok(None),
        }
    }

    /// Load a chain, creating a tracking-only record when it is unknown
    pub async fn remote_chain(&self, chain_id: &str) -> Result<Blockchain> {
        if let Some(chain) = self.load(chain_id).await? {
            return Ok(chain);
        }
        let chain = Blockchain::new(Identity::from_public(chain_id)?, self.repository.clone());
        if chain.save().await? {
            info!(chain_id, "Tracking remote chain");
        }
        Ok(chain)
    }

    pub async fn all_chains(&self) -> Result<Vec<Blockchain>> {
        let records = self.repository.all_chains().await?;
        let mut chains = Vec::with_capacity(records.len());
        for record in &records {
            match self.handle(record) {
                Ok(chain) => chains.push(chain),
                Err(e) => warn!(chain_id = %record.public_key, "Skipping unreadable chain: {}", e),
            }
        }
        Ok(chains)
    }

    pub async fn owned_chains(&self) -> Result<Vec<Blockchain>> {
        Ok(self
            .all_chains()
            .await?
            .into_iter()
            .filter(Blockchain::is_owner)
            .collect())
    }

    /// Create and append the next block of an owned chain
    pub async fn append(&self, chain: &Blockchain, payload: Vec<u8>) -> Result<Block> {
        let writer = self.writer(&chain.id());
        let _guard = writer.lock().await;

        let block = chain.create_block(payload).await?;
        if !chain.save_block(&block).await? {
            return Err(ChainmeshError::validation(format!(
                "block {} at height {} was refused",
                block.hash, block.height
            )));
        }
        Ok(block)
    }

    /// Store a block received from the network
    ///
    /// The chain is tracked on demand. Blocks whose chain id is not a key are
    /// refused before the repository is touched.
    pub async fn accept_block(&self, block: &Block) -> Result<bool> {
        if Identity::from_public(&block.chain_id).is_err() {
            return Ok(false);
        }
        let chain = self.remote_chain(&block.chain_id).await?;

        let writer = self.writer(&block.chain_id);
        let _guard = writer.lock().await;
        chain.save_block(block).await
    }
}
