//! Ledger node service
//!
//! `LedgerNode` owns one [`Blockchain`] behind an async read/write lock and
//! performs all I/O around it: persistence, block broadcast, chain sync and
//! peer discovery. No lock on the ledger is held while a peer or the store
//! is being awaited, and proof-of-work runs on the blocking pool.
//!
//! Store writes are ordered by a persist lock that is taken while the ledger
//! write lock is still held, so the store sees mutations in the order the
//! ledger applied them. Lock order is always ledger, then persist.

use crate::block::{Block, BlockSummary, MiningError, MiningLimits};
use crate::blockchain::{Blockchain, ChainConfig};
use crate::peer::{PeerError, PeerOutcome, PeerTransport};
use crate::storage::BlockStore;
use crate::transaction::{Transaction, TransactionRequest};
use crate::{Amount, BlockIndex, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Endpoint other peers use to reach this node; never added as a peer
    pub self_url: Option<String>,
    pub chain: ChainConfig,
    /// Applied to mining requests that carry no budget of their own
    pub max_mining_iterations: Option<u64>,
    pub sync_after_mine: bool,
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_url: None,
            chain: ChainConfig::default(),
            max_mining_iterations: None,
            sync_after_mine: false,
            bootstrap_peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MiningReport {
    pub block: BlockSummary,
    pub attempts: u64,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Set when the block could not be written to the store
    pub persistence_error: Option<String>,
    pub broadcast: Vec<PeerOutcome>,
    pub sync: Option<SyncReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockReceipt {
    pub accepted: bool,
    /// Stable rejection code, `None` when accepted
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl BlockReceipt {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
            message: None,
        }
    }

    fn rejected(reason: &str, message: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.to_string()),
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub replaced: bool,
    pub chain_length: usize,
    pub adopted_from: Option<String>,
    pub peer_results: Vec<PeerOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub peer: String,
    /// Whether `peer` itself was new
    pub added: bool,
    /// Endpoints learned from `peer`'s peer list
    pub discovered: Vec<String>,
    pub result: std::result::Result<(), PeerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub chain_length: usize,
    pub latest_hash: String,
    pub pending_transactions: usize,
    pub peers: usize,
    pub difficulty: usize,
    pub mining_reward: Amount,
    pub is_valid: bool,
}

#[derive(Clone)]
pub struct LedgerNode {
    config: NodeConfig,
    ledger: Arc<RwLock<Blockchain>>,
    /// One mining attempt in flight per node
    mining: Arc<Mutex<()>>,
    /// Held across each store write
    persist: Arc<Mutex<()>>,
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn BlockStore>,
}

impl LedgerNode {
    /// Rehydrate the ledger from `store` and register bootstrap peers.
    ///
    /// Storage problems never fail startup: an unreadable or invalid stored
    /// chain is quarantined and the store restarts from a fresh genesis chain.
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        info!("🚀 Starting ledger node");
        let ledger = Self::rehydrate(&config.chain, store.as_ref()).await;
        info!(
            "⛓️  Chain loaded: {} blocks, tip {}",
            ledger.len(),
            ledger.latest_block().hash
        );

        let node = Self {
            config,
            ledger: Arc::new(RwLock::new(ledger)),
            mining: Arc::new(Mutex::new(())),
            persist: Arc::new(Mutex::new(())),
            transport,
            store,
        };

        for peer in node.config.bootstrap_peers.clone() {
            node.add_peer(peer).await;
        }
        node
    }

    async fn rehydrate(config: &ChainConfig, store: &dyn BlockStore) -> Blockchain {
        match store.load_blocks().await {
            Ok(blocks) if blocks.is_empty() => {
                let ledger = Blockchain::new(config.clone());
                if let Err(e) = store.save_block(ledger.latest_block()).await {
                    error!("Failed to persist genesis block: {}", e);
                }
                ledger
            }
            Ok(blocks) => match Blockchain::from_blocks(config.clone(), blocks) {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!("Stored chain is invalid, starting from genesis: {}", e);
                    Self::reset_store(config, store).await
                }
            },
            Err(e) => {
                warn!("Failed to load stored chain, starting from genesis: {}", e);
                Self::reset_store(config, store).await
            }
        }
    }

    /// Move unusable stored data aside and restart the store from genesis
    async fn reset_store(config: &ChainConfig, store: &dyn BlockStore) -> Blockchain {
        let ledger = Blockchain::new(config.clone());
        match store.quarantine().await {
            Ok(()) => {
                if let Err(e) = store.replace_all(ledger.chain()).await {
                    error!("Failed to persist genesis block: {}", e);
                }
            }
            // never overwrite data we could not move aside
            Err(e) => error!("Failed to quarantine stored chain: {}", e),
        }
        ledger
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn submit_transaction(&self, transaction: Transaction) -> Result<()> {
        self.ledger.write().await.add_transaction(transaction)
    }

    /// Submit a transaction in its boundary form
    pub async fn submit_request(&self, request: TransactionRequest) -> Result<()> {
        let transaction = Transaction::try_from(request)?;
        self.submit_transaction(transaction).await
    }

    /// Mine the pending pool into a new block crediting `reward_address`.
    ///
    /// Transactions submitted while the proof-of-work search runs stay
    /// pending for the next block. Peer and storage failures after the
    /// commit are reported, not returned.
    pub async fn mine(&self, reward_address: &str, limits: MiningLimits) -> Result<MiningReport> {
        let limits = self.effective_limits(limits);

        let (block, stats, persist) = {
            let _mining = self.mining.lock().await;

            let (mut candidate, consumed, difficulty) = {
                let ledger = self.ledger.read().await;
                (
                    ledger.prepare_candidate(reward_address),
                    ledger.pending_transactions().len(),
                    ledger.difficulty(),
                )
            };
            info!(
                "⛏️  Mining block #{} with {} transactions at difficulty {}",
                candidate.index,
                candidate.transactions.len(),
                difficulty
            );

            let (mined, stats) = tokio::task::spawn_blocking(move || {
                candidate
                    .mine_with(difficulty, &limits)
                    .map(|stats| (candidate, stats))
            })
            .await
            .map_err(|e| MiningError::WorkerFailed {
                reason: e.to_string(),
            })??;

            let mut ledger = self.ledger.write().await;
            ledger.commit_mined_block(mined.clone(), consumed)?;
            let persist = self.persist.lock().await;
            (mined, stats, persist)
        };

        info!(
            "✅ Block #{} committed after {} attempts ({:.0} H/s)",
            block.index,
            stats.attempts,
            stats.hash_rate()
        );

        let persistence_error = match self.store.save_block(&block).await {
            Ok(()) => None,
            Err(e) => {
                error!("Failed to persist block #{}: {}", block.index, e);
                Some(e.to_string())
            }
        };
        drop(persist);

        let broadcast = self.broadcast_block(&block).await;
        let sync = if self.config.sync_after_mine {
            Some(self.sync_chain().await)
        } else {
            None
        };

        Ok(MiningReport {
            block: block.summary(),
            attempts: stats.attempts,
            elapsed: stats.elapsed,
            persistence_error,
            broadcast,
            sync,
        })
    }

    fn effective_limits(&self, mut limits: MiningLimits) -> MiningLimits {
        if limits.max_iterations.is_none() {
            limits.max_iterations = self.config.max_mining_iterations;
        }
        limits
    }

    /// Offer a block received from a peer to the ledger
    pub async fn receive_block(&self, block: Block) -> BlockReceipt {
        let _persist = {
            let mut ledger = self.ledger.write().await;
            if let Err(e) = ledger.receive_block(block.clone()) {
                return BlockReceipt::rejected(e.code(), e.to_string());
            }
            self.persist.lock().await
        };

        if let Err(e) = self.store.save_block(&block).await {
            error!("Failed to persist received block #{}: {}", block.index, e);
        }
        BlockReceipt::accepted()
    }

    /// Fetch every peer's chain concurrently and adopt the longest valid
    /// one that beats the local chain
    pub async fn sync_chain(&self) -> SyncReport {
        let peers = self.peers().await;
        let transport = &self.transport;
        let fetched = join_all(peers.into_iter().map(|peer| async move {
            let result = transport.fetch_chain(&peer).await;
            (peer, result)
        }))
        .await;

        let mut report = SyncReport {
            replaced: false,
            chain_length: 0,
            adopted_from: None,
            peer_results: Vec::with_capacity(fetched.len()),
        };

        let adopted = {
            let mut ledger = self.ledger.write().await;
            for (peer, result) in fetched {
                match result {
                    Ok(chain) => {
                        debug!("Peer {} offered a chain of {} blocks", peer, chain.len());
                        if ledger.replace_chain(chain) {
                            report.replaced = true;
                            report.adopted_from = Some(peer.clone());
                        }
                        report.peer_results.push(PeerOutcome { peer, result: Ok(()) });
                    }
                    Err(e) => {
                        warn!("Chain fetch failed: {}", e);
                        report.peer_results.push(PeerOutcome { peer, result: Err(e) });
                    }
                }
            }
            report.chain_length = ledger.len();
            if report.replaced {
                Some((ledger.chain().to_vec(), self.persist.lock().await))
            } else {
                None
            }
        };

        if let Some((chain, _persist)) = adopted {
            if let Err(e) = self.store.replace_all(&chain).await {
                error!("Failed to persist adopted chain: {}", e);
            }
        }
        report
    }

    /// Register a peer and merge the peers it knows about (one hop)
    pub async fn add_peer(&self, peer: impl Into<String>) -> DiscoveryReport {
        let peer = peer.into();
        let self_url = self.config.self_url.as_deref();

        if peer.is_empty() || Some(peer.as_str()) == self_url {
            return DiscoveryReport {
                peer,
                added: false,
                discovered: Vec::new(),
                result: Ok(()),
            };
        }

        let added = self.ledger.write().await.add_peer(peer.clone());
        if added {
            info!("🤝 Added peer {}", peer);
        }

        match self.transport.fetch_peers(&peer).await {
            Ok(known) => {
                let discovered = self.ledger.write().await.merge_peers(known, self_url);
                if !discovered.is_empty() {
                    info!("🔍 Discovered {} peers via {}", discovered.len(), peer);
                }
                DiscoveryReport {
                    peer,
                    added,
                    discovered,
                    result: Ok(()),
                }
            }
            Err(e) => {
                warn!("Peer discovery failed: {}", e);
                DiscoveryReport {
                    peer,
                    added,
                    discovered: Vec::new(),
                    result: Err(e),
                }
            }
        }
    }

    /// Send `block` to every known peer; failures are collected per peer
    pub async fn broadcast_block(&self, block: &Block) -> Vec<PeerOutcome> {
        let peers = self.peers().await;
        let transport = &self.transport;
        let outcomes = join_all(peers.into_iter().map(|peer| async move {
            let result = transport.send_block(&peer, block).await;
            PeerOutcome { peer, result }
        }))
        .await;

        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                warn!("Broadcast of block #{} failed: {}", block.index, e);
            }
        }
        outcomes
    }

    pub async fn chain(&self) -> Vec<Block> {
        self.ledger.read().await.chain().to_vec()
    }

    pub async fn latest_block(&self) -> Block {
        self.ledger.read().await.latest_block().clone()
    }

    pub async fn pending_transactions(&self) -> Vec<Transaction> {
        self.ledger.read().await.pending_transactions().to_vec()
    }

    pub async fn balance_of(&self, address: &str) -> Amount {
        self.ledger.read().await.balance_of(address)
    }

    pub async fn history_of(&self, address: &str) -> Vec<(BlockIndex, Transaction)> {
        self.ledger.read().await.transactions_for_address(address)
    }

    pub async fn is_chain_valid(&self) -> bool {
        self.ledger.read().await.is_chain_valid()
    }

    pub async fn peers(&self) -> Vec<String> {
        self.ledger.read().await.peers()
    }

    pub async fn status(&self) -> NodeStatus {
        let ledger = self.ledger.read().await;
        NodeStatus {
            chain_length: ledger.len(),
            latest_hash: ledger.latest_block().hash.clone(),
            pending_transactions: ledger.pending_transactions().len(),
            peers: ledger.peers().len(),
            difficulty: ledger.difficulty(),
            mining_reward: ledger.mining_reward(),
            is_valid: ledger.is_chain_valid(),
        }
    }

    /// Run `f` against the ledger under the write lock
    pub async fn with_ledger<T>(&self, f: impl FnOnce(&mut Blockchain) -> T) -> T {
        f(&mut *self.ledger.write().await)
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockStore;
    use crate::BlockchainError;
    use crate::wallet::Wallet;
    use async_trait::async_trait;

    /// Transport for a node without reachable peers
    struct OfflineTransport;

    #[async_trait]
    impl PeerTransport for OfflineTransport {
        async fn fetch_chain(&self, peer: &str) -> std::result::Result<Vec<Block>, PeerError> {
            Err(offline(peer))
        }

        async fn fetch_peers(&self, peer: &str) -> std::result::Result<Vec<String>, PeerError> {
            Err(offline(peer))
        }

        async fn send_block(&self, peer: &str, _block: &Block) -> std::result::Result<(), PeerError> {
            Err(offline(peer))
        }
    }

    fn offline(peer: &str) -> PeerError {
        PeerError::Unreachable {
            peer: peer.to_string(),
            reason: "offline".to_string(),
        }
    }

    fn test_config() -> NodeConfig {
        NodeConfig {
            chain: ChainConfig {
                difficulty: 2,
                ..ChainConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    async fn start_node(store: Arc<MemoryBlockStore>) -> LedgerNode {
        LedgerNode::start(test_config(), Arc::new(OfflineTransport), store).await
    }

    #[tokio::test]
    async fn test_start_persists_genesis() {
        let store = Arc::new(MemoryBlockStore::new());
        let node = start_node(store.clone()).await;

        assert_eq!(node.chain().await.len(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_mine_persists_and_reports_peer_failures() {
        let store = Arc::new(MemoryBlockStore::new());
        let node = start_node(store.clone()).await;
        node.with_ledger(|ledger| ledger.add_peer("http://down:3000")).await;

        let report = node.mine("miner", MiningLimits::unbounded()).await.unwrap();

        assert_eq!(report.block.index, 1);
        assert_eq!(report.block.transaction_count, 1);
        assert!(report.block.hash.starts_with("00"));
        assert!(report.persistence_error.is_none());
        assert_eq!(report.broadcast.len(), 1);
        assert!(!report.broadcast[0].is_ok());
        assert_eq!(store.len().await, 2);
        assert_eq!(node.balance_of("miner").await, 50.0);
    }

    #[tokio::test]
    async fn test_mining_budget_from_config() {
        let mut config = test_config();
        config.chain.difficulty = 64;
        config.max_mining_iterations = Some(3);
        let node = LedgerNode::start(
            config,
            Arc::new(OfflineTransport),
            Arc::new(MemoryBlockStore::new()),
        )
        .await;

        let err = node.mine("miner", MiningLimits::unbounded()).await.unwrap_err();
        assert!(matches!(
            err,
            BlockchainError::Mining(MiningError::IterationBudgetExhausted { attempts: 3 })
        ));
        assert_eq!(node.chain().await.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_request() {
        let node = start_node(Arc::new(MemoryBlockStore::new())).await;
        let wallet = Wallet::new();
        let tx = wallet.create_transaction("bob", 4.0).unwrap();

        let request = TransactionRequest {
            from_address: tx.from_address.clone(),
            to_address: None,
            amount: Some(4.0),
            signature: tx.signature.clone(),
        };
        let err = node.submit_request(request).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(err.code(), "invalid_transaction");

        let request = TransactionRequest {
            from_address: tx.from_address.clone(),
            to_address: Some("bob".to_string()),
            amount: Some(4.0),
            signature: tx.signature.clone(),
        };
        node.submit_request(request).await.unwrap();
        assert_eq!(node.pending_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_block_receipts() {
        let store = Arc::new(MemoryBlockStore::new());
        let node = start_node(store.clone()).await;

        let mut source = Blockchain::new(test_config().chain);
        let block = source
            .mine_pending_transactions("peer-miner", &MiningLimits::unbounded())
            .unwrap();

        let receipt = node.receive_block(block.clone()).await;
        assert!(receipt.accepted);
        assert_eq!(store.len().await, 2);

        let receipt = node.receive_block(block).await;
        assert!(!receipt.accepted);
        assert_eq!(receipt.reason.as_deref(), Some("does_not_extend_tip"));
        assert_eq!(node.chain().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rehydrates_stored_chain() {
        let mut ledger = Blockchain::new(test_config().chain);
        ledger
            .mine_pending_transactions("miner", &MiningLimits::unbounded())
            .unwrap();
        let store = Arc::new(MemoryBlockStore::with_blocks(ledger.chain().to_vec()));

        let node = start_node(store).await;
        assert_eq!(node.chain().await, ledger.chain());
        assert_eq!(node.balance_of("miner").await, 50.0);
    }

    #[tokio::test]
    async fn test_invalid_stored_chain_falls_back_to_genesis() {
        let mut ledger = Blockchain::new(test_config().chain);
        ledger
            .mine_pending_transactions("miner", &MiningLimits::unbounded())
            .unwrap();
        let mut blocks = ledger.chain().to_vec();
        blocks[1].transactions[0].amount = 1_000_000.0;

        let store = Arc::new(MemoryBlockStore::with_blocks(blocks));
        let node = start_node(store.clone()).await;
        assert_eq!(node.chain().await.len(), 1);
        assert!(node.is_chain_valid().await);

        // the tampered chain is set aside and the store holds genesis only
        assert_eq!(store.quarantined().await.len(), 1);
        assert_eq!(store.load_blocks().await.unwrap(), node.chain().await);
    }

    #[tokio::test]
    async fn test_self_url_is_never_a_peer() {
        let mut config = test_config();
        config.self_url = Some("http://me:3000".to_string());
        let node = LedgerNode::start(
            config,
            Arc::new(OfflineTransport),
            Arc::new(MemoryBlockStore::new()),
        )
        .await;

        let report = node.add_peer("http://me:3000").await;
        assert!(!report.added);
        assert!(node.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let node = start_node(Arc::new(MemoryBlockStore::new())).await;
        let status = node.status().await;

        assert_eq!(status.chain_length, 1);
        assert_eq!(status.pending_transactions, 0);
        assert_eq!(status.difficulty, 2);
        assert_eq!(status.mining_reward, 50.0);
        assert!(status.is_valid);
    }
}
