//! Gossip and synchronization
//!
//! The [`ShareManager`] owns the active peer sets and the broadcast
//! deduplication cache. Connection tasks never call into it directly; they
//! emit [`PeerEvent`]s that [`ShareManager::run`] consumes.

use crate::chain::Blockchain;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::factory::SentenceFactory;
use crate::network::{
    peer, Message, MessageType, PeerAddress, PeerEvent, PeerHandle, PeerRecord, PeerSummary,
};
use crate::sentence::{ErrorSentence, Info, NewBlock, Sentence, WantBlocks};
use lru::LruCache;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with an outbound peer whose connection was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Reconnect(Duration),
    Drop,
}

/// An outbound peer and its reconnection bookkeeping
#[derive(Debug)]
pub struct ServerSlot {
    pub record: PeerRecord,
    pub retry_count: u32,
    handle: Option<PeerHandle>,
    retry: Option<(Duration, JoinHandle<()>)>,
}

impl ServerSlot {
    pub fn new(record: PeerRecord) -> Self {
        Self {
            record,
            retry_count: 0,
            handle: None,
            retry: None,
        }
    }

    /// Account for one lost connection
    ///
    /// The counter is never reset, so a peer gets at most `max_retry`
    /// reconnections per process run.
    pub fn on_lost(&mut self, max_retry: u32) -> RetryDecision {
        self.record.rank -= 1;
        self.retry_count += 1;
        if self.retry_count <= max_retry {
            RetryDecision::Reconnect(Duration::from_secs(u64::from(self.retry_count).pow(4)))
        } else {
            RetryDecision::Drop
        }
    }

    fn cancel_retry(&mut self) {
        if let Some((_, task)) = self.retry.take() {
            task.abort();
        }
    }
}

struct ShareState {
    /// Peers we dialled
    servers: HashMap<PeerAddress, ServerSlot>,
    /// Peers that dialled us
    clients: HashMap<PeerAddress, PeerHandle>,
    broadcast_cache: LruCache<String, NewBlock>,
}

impl ShareState {
    fn connected(&self) -> impl Iterator<Item = &PeerHandle> {
        self.servers
            .values()
            .filter_map(|slot| slot.handle.as_ref())
            .chain(self.clients.values())
    }
}

pub struct ShareManager {
    factory: SentenceFactory,
    config: NodeConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<ShareState>,
}

/// Last message of a BLOCKS answer sequence
fn is_last_page(message: &Message) -> bool {
    if message.kind == MessageType::Error {
        return true;
    }
    let content = &message.content;
    content.get("type").and_then(Value::as_str) != Some("blocks")
        || content.get("end").and_then(Value::as_bool).unwrap_or(true)
}

impl ShareManager {
    pub fn new(
        factory: SentenceFactory,
        config: NodeConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let cache_size = NonZeroUsize::new(config.broadcast_cache_size).unwrap_or(NonZeroUsize::MIN);
        let manager = Arc::new(Self {
            factory,
            config,
            events,
            state: Mutex::new(ShareState {
                servers: HashMap::new(),
                clients: HashMap::new(),
                broadcast_cache: LruCache::new(cache_size),
            }),
        });
        (manager, receiver)
    }

    /// Sender for connection tasks to report on
    pub fn events(&self) -> mpsc::UnboundedSender<PeerEvent> {
        self.events.clone()
    }

    pub fn factory(&self) -> &SentenceFactory {
        &self.factory
    }

    /// Consume connection events until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(PeerEvent::Connected(peer)) => self.peer_in(peer).await,
                    Some(PeerEvent::Message(peer, message)) => {
                        let manager = self.clone();
                        tokio::spawn(async move { manager.handle(message, peer).await });
                    },
                    Some(PeerEvent::Disconnected(peer)) => self.peer_out(peer).await,
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Dial a directory entry as an outbound peer
    ///
    /// Returns `false` when a connection to it is already open.
    pub async fn connect(&self, record: PeerRecord) -> bool {
        let address = record.peer_address();

        let mut state = self.state.lock().await;
        let slot = state
            .servers
            .entry(address.clone())
            .or_insert_with(|| ServerSlot::new(record));
        if slot.handle.is_some() {
            return false;
        }
        slot.cancel_retry();
        slot.handle = Some(peer::connect(
            address,
            slot.record.rank,
            self.events.clone(),
            self.config.connect_timeout(),
        ));
        true
    }

    async fn reconnect(&self, address: &PeerAddress) {
        let mut state = self.state.lock().await;
        let Some(slot) = state.servers.get_mut(address) else {
            return;
        };
        slot.retry = None;
        if slot.handle.is_none() {
            info!(peer = %address, attempt = slot.retry_count, "Reconnecting");
            slot.handle = Some(peer::connect(
                address.clone(),
                slot.record.rank,
                self.events.clone(),
                self.config.connect_timeout(),
            ));
        }
    }

    async fn peer_in(&self, peer: PeerHandle) {
        info!(peer = %peer.address(), direction = ?peer.direction(), "Peer in");

        if peer.is_server() {
            match self.factory.info().await {
                Ok(info) => {
                    if let Err(e) = peer.try_send(Sentence::from(info).question()) {
                        warn!(peer = %peer.address(), "Handshake failed: {}", e);
                    }
                },
                Err(e) => warn!("Cannot build INFO: {}", e),
            }
            return;
        }

        let mut state = self.state.lock().await;
        if state.clients.len() >= self.config.max_peers {
            warn!(peer = %peer.address(), "Too many peers ({}), closing", state.clients.len());
            peer.close();
            return;
        }
        state.clients.insert(peer.address().clone(), peer);
    }

    async fn peer_out(self: &Arc<Self>, peer: PeerHandle) {
        let address = peer.address().clone();
        let mut state = self.state.lock().await;

        if !peer.is_server() {
            if state
                .clients
                .get(&address)
                .is_some_and(|known| known.same_connection(&peer))
            {
                state.clients.remove(&address);
                info!(peer = %address, "Peer out");
            }
            return;
        }

        let Some(slot) = state.servers.get_mut(&address) else {
            return;
        };
        if !slot
            .handle
            .as_ref()
            .is_some_and(|known| known.same_connection(&peer))
        {
            return;
        }
        slot.handle = None;
        slot.record.rank = peer.rank();

        let decision = slot.on_lost(self.config.peers.retry);
        warn!(
            peer = %address,
            rank = slot.record.rank,
            retry_count = slot.retry_count,
            "Peer out"
        );
        if let Err(e) = self.factory.ledger().repository().upsert_peer(slot.record.clone()).await {
            warn!(peer = %address, "Cannot persist peer: {}", e);
        }

        match decision {
            RetryDecision::Reconnect(delay) => {
                warn!(peer = %address, "Retry after {} secs", delay.as_secs());
                let manager = Arc::downgrade(self);
                let target = address.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(manager) = manager.upgrade() {
                        manager.reconnect(&target).await;
                    }
                });
                slot.cancel_retry();
                slot.retry = Some((delay, task));
            },
            RetryDecision::Drop => {
                info!(peer = %address, "Giving up on peer");
                state.servers.remove(&address);
            },
        }
    }

    async fn handle(self: &Arc<Self>, message: Message, peer: PeerHandle) {
        let Some(sentence) = Sentence::from_message(&message) else {
            let rank = peer.penalize(1);
            warn!(peer = %peer.address(), rank, "Bad sentence: {}", message.content);
            return;
        };
        debug!(peer = %peer.address(), kind = ?message.kind, "Received {}", sentence.kind());

        let result = match message.kind {
            MessageType::Question => self.handle_question(sentence, &message, &peer).await,
            MessageType::Answer => self.handle_answer(sentence, &peer).await,
            MessageType::Broadcast => self.handle_broadcast(sentence, &message, &peer).await,
            MessageType::Error => {
                if let Sentence::Error(error) = sentence {
                    warn!(peer = %peer.address(), code = error.code, "Peer error: {}", error.desc);
                }
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!(peer = %peer.address(), "Handling {} failed: {}", message.identifier, e);
        }
    }

    async fn handle_question(
        self: &Arc<Self>,
        sentence: Sentence,
        question: &Message,
        peer: &PeerHandle,
    ) -> Result<()> {
        match sentence {
            Sentence::Info(info) => {
                let ours = self.factory.info().await?;
                peer.send(Sentence::from(ours).answer_to(question), None).await?;
                self.info_actions(&info, peer).await
            },
            Sentence::WantBlocks(want) => match self.factory.send_blocks(&want).await? {
                Some(pages) => {
                    for page in pages {
                        peer.send(Sentence::from(page).answer_to(question), None).await?;
                    }
                    Ok(())
                },
                None => {
                    let error = ErrorSentence::new(404, format!("unknown chain {}", want.chain_id));
                    peer.send(Sentence::from(error).answer_to(question), None).await
                },
            },
            Sentence::WantPeers(want) => {
                let peers = self.factory.send_peers(&want, peer.address()).await?;
                peer.send(Sentence::from(peers).answer_to(question), None).await
            },
            other => {
                let error = ErrorSentence::new(400, format!("unexpected question {}", other.kind()));
                peer.send(Sentence::from(error).answer_to(question), None).await
            },
        }
    }

    async fn handle_answer(self: &Arc<Self>, sentence: Sentence, peer: &PeerHandle) -> Result<()> {
        match sentence {
            Sentence::Info(info) => self.info_actions(&info, peer).await,
            Sentence::Blocks(page) => self.factory.handle_blocks(&page).await.map(|_| ()),
            Sentence::Peers(peers) => {
                let merged = self.factory.handle_peers(&peers).await?;
                debug!(peer = %peer.address(), "Merged {} directory entries", merged);
                Ok(())
            },
            Sentence::Error(error) => {
                warn!(peer = %peer.address(), code = error.code, "Peer error: {}", error.desc);
                Ok(())
            },
            other => {
                debug!(peer = %peer.address(), "Ignoring {} answer", other.kind());
                Ok(())
            },
        }
    }

    async fn handle_broadcast(
        self: &Arc<Self>,
        sentence: Sentence,
        message: &Message,
        peer: &PeerHandle,
    ) -> Result<()> {
        let new_block = match sentence {
            Sentence::NewBlock(new_block) => new_block,
            other => {
                debug!(peer = %peer.address(), "Ignoring {} broadcast", other.kind());
                return Ok(());
            },
        };

        {
            let mut state = self.state.lock().await;
            if state.broadcast_cache.contains(&message.identifier) {
                debug!(identifier = %message.identifier, "Duplicate broadcast");
                return Ok(());
            }
            state
                .broadcast_cache
                .put(message.identifier.clone(), new_block.clone());
        }

        let Some(want) = self.factory.want_blocks_for_new_block(&new_block).await? else {
            return Ok(());
        };
        if self.sync_blocks(peer, want).await? {
            let sent = self.broadcast(message, Some(peer)).await;
            debug!(chain_id = %new_block.chain_id, height = new_block.height, "Relayed to {} peers", sent);
        }
        Ok(())
    }

    /// Request the missing blocks of one or more chains, plus the directory
    async fn info_actions(self: &Arc<Self>, info: &Info, peer: &PeerHandle) -> Result<()> {
        for want in self.factory.want_blocks_for_info(info).await? {
            let manager = self.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let chain_id = want.chain_id.clone();
                if let Err(e) = manager.sync_blocks(&peer, want).await {
                    warn!(peer = %peer.address(), %chain_id, "Sync failed: {}", e);
                }
            });
        }

        if self.config.peers.sync {
            if let Some(want) = SentenceFactory::want_peers_for_info(info) {
                peer.send(Sentence::from(want).question(), None).await?;
            }
        }
        Ok(())
    }

    /// Ask `peer` for a block range and store the pages as they arrive
    ///
    /// Returns `true` once the final page was received.
    pub async fn sync_blocks(&self, peer: &PeerHandle, want: WantBlocks) -> Result<bool> {
        info!(
            peer = %peer.address(),
            chain_id = %want.chain_id,
            from = want.from,
            to = want.to,
            "Requesting blocks"
        );
        let mut answers = peer.ask(Sentence::from(want).question(), is_last_page).await?;

        while let Some(message) = answers.next_within(self.config.answer_timeout()).await? {
            match Sentence::from_message(&message) {
                Some(Sentence::Blocks(page)) => {
                    if let Err(e) = self.factory.handle_blocks(&page).await {
                        answers.cancel().await;
                        return Err(e);
                    }
                    if page.end {
                        return Ok(true);
                    }
                },
                Some(Sentence::Error(error)) => {
                    warn!(peer = %peer.address(), code = error.code, "Block request refused: {}", error.desc);
                    return Ok(false);
                },
                _ => {
                    let rank = peer.penalize(1);
                    warn!(peer = %peer.address(), rank, "Bad answer to block request");
                    return Ok(false);
                },
            }
        }
        Ok(false)
    }

    /// Send `message` to every connected peer except `without`
    ///
    /// Returns the number of peers it was queued for. A NEW_BLOCK is recorded
    /// so that its echo is not processed again.
    pub async fn broadcast(&self, message: &Message, without: Option<&PeerHandle>) -> usize {
        let mut state = self.state.lock().await;
        if let Some(Sentence::NewBlock(new_block)) = Sentence::from_message(message) {
            state.broadcast_cache.put(message.identifier.clone(), new_block);
        }

        let mut sent = 0;
        for peer in state.connected() {
            if without.is_some_and(|source| source.address() == peer.address()) {
                continue;
            }
            match peer.try_send(message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer.address(), "Broadcast not delivered: {}", e),
            }
        }
        sent
    }

    /// Tell every peer about the current head of `chain`
    pub async fn announce(&self, chain: &Blockchain) -> Result<usize> {
        let new_block = SentenceFactory::new_block(chain).await?;
        info!(chain_id = %new_block.chain_id, height = new_block.height, "Announcing block");
        let message = Sentence::from(new_block).broadcast();
        Ok(self.broadcast(&message, None).await)
    }

    pub async fn active_peers(&self) -> Vec<PeerSummary> {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerSummary> = state.connected().map(PeerHandle::summary).collect();
        peers.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
        peers
    }

    /// Pending reconnection delay for an outbound peer
    pub async fn retry_delay(&self, address: &PeerAddress) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .servers
            .get(address)
            .and_then(|slot| slot.retry.as_ref().map(|(delay, _)| *delay))
    }

    /// Cancel pending retries and close every connection
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for slot in state.servers.values_mut() {
            slot.cancel_retry();
            if let Some(handle) = slot.handle.take() {
                handle.close();
            }
        }
        for client in state.clients.values() {
            client.close();
        }
        state.servers.clear();
        state.clients.clear();
    }
}
