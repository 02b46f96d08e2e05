//! Ledger engine
//!
//! `Blockchain` owns the chain, the pending transaction pool, the peer set
//! and the contract registry. It is a plain synchronous value; sharing it
//! between tasks is the job of [`crate::node::LedgerNode`].

use crate::block::{Block, MiningLimits};
use crate::contracts::{ContractRegistry, SmartContract};
use crate::transaction::Transaction;
use crate::{utils, Amount, BlockIndex, BlockchainError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Previous-hash value of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Ledger parameters fixed for the lifetime of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Required number of leading hex zeros in a block hash
    pub difficulty: usize,
    pub mining_reward: Amount,
    /// Timestamp of the genesis block; shared by all nodes of a network
    pub genesis_timestamp: Timestamp,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 3,
            mining_reward: 50.0,
            genesis_timestamp: 0,
        }
    }
}

/// Structural defect found in a chain or in a block offered to it
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum ChainLinkageError {
    #[error("block {index} does not extend the tip: previous hash {previous_hash}, tip {tip_hash}")]
    DoesNotExtendTip {
        index: BlockIndex,
        previous_hash: String,
        tip_hash: String,
    },

    #[error("block {index} hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch {
        index: BlockIndex,
        stored: String,
        computed: String,
    },

    #[error("block {index} links to {previous_hash} but its predecessor is {expected}")]
    BrokenLink {
        index: BlockIndex,
        previous_hash: String,
        expected: String,
    },

    #[error("chain is empty")]
    EmptyChain,
}

impl ChainLinkageError {
    pub fn code(&self) -> &'static str {
        match self {
            ChainLinkageError::DoesNotExtendTip { .. } => "does_not_extend_tip",
            ChainLinkageError::HashMismatch { .. } => "hash_mismatch",
            ChainLinkageError::BrokenLink { .. } => "broken_link",
            ChainLinkageError::EmptyChain => "empty_chain",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    config: ChainConfig,
    chain: Vec<Block>,
    pending_transactions: Vec<Transaction>,
    peers: BTreeSet<String>,
    contracts: ContractRegistry,
}

impl Blockchain {
    /// Create a ledger holding only the genesis block
    pub fn new(config: ChainConfig) -> Self {
        let genesis = Self::create_genesis_block(&config);
        Self {
            config,
            chain: vec![genesis],
            pending_transactions: Vec::new(),
            peers: BTreeSet::new(),
            contracts: ContractRegistry::new(),
        }
    }

    /// Rebuild a ledger from stored blocks, which must form a valid chain
    pub fn from_blocks(config: ChainConfig, mut blocks: Vec<Block>) -> Result<Self> {
        blocks.sort_by_key(|block| block.index);
        Self::validate_chain(&blocks)?;

        let mut ledger = Self::new(config);
        ledger.chain = blocks;
        Ok(ledger)
    }

    /// Index 0, no transactions, sentinel previous hash
    pub fn create_genesis_block(config: &ChainConfig) -> Block {
        Block::new(0, config.genesis_timestamp, Vec::new(), GENESIS_PREVIOUS_HASH)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn difficulty(&self) -> usize {
        self.config.difficulty
    }

    pub fn mining_reward(&self) -> Amount {
        self.config.mining_reward
    }

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Always false; the chain holds at least the genesis block
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn latest_block(&self) -> &Block {
        // chain is never empty
        &self.chain[self.chain.len() - 1]
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending_transactions
    }

    /// Admit a transaction to the pending pool.
    ///
    /// Checks run in order: both addresses present, signature valid, every
    /// registered contract approves. Identical resubmissions are admitted.
    pub fn add_transaction(&mut self, transaction: Transaction) -> Result<()> {
        let has_sender = transaction.from_address.as_deref().map_or(false, |a| !a.is_empty());
        if !has_sender || transaction.to_address.is_empty() {
            return Err(BlockchainError::InvalidTransaction(
                "Transaction must include from and to address".to_string(),
            ));
        }

        if !transaction.is_valid() {
            return Err(BlockchainError::InvalidSignature(
                "Cannot add invalid transaction to chain".to_string(),
            ));
        }

        if let Err(rejection) = self.contracts.evaluate(&transaction) {
            warn!(
                "Transaction rejected by contract {}: {}",
                rejection.contract_id, rejection.reason
            );
            return Err(BlockchainError::ContractRejected {
                contract_id: rejection.contract_id,
                reason: rejection.reason,
            });
        }

        debug!(
            "Transaction {} admitted to pending pool",
            transaction.compute_hash()
        );
        self.pending_transactions.push(transaction);
        Ok(())
    }

    /// Build an unmined block from the current pool plus a reward for
    /// `reward_address`. The pool itself is left untouched.
    pub fn prepare_candidate(&self, reward_address: &str) -> Block {
        self.prepare_candidate_at(reward_address, utils::now_millis())
    }

    fn prepare_candidate_at(&self, reward_address: &str, timestamp: Timestamp) -> Block {
        let mut transactions = self.pending_transactions.clone();
        transactions.push(Transaction::reward(reward_address, self.config.mining_reward));

        let tip = self.latest_block();
        Block::new(
            self.chain.len() as BlockIndex,
            timestamp,
            transactions,
            tip.hash.clone(),
        )
    }

    /// Append a block produced by [`Self::prepare_candidate`] and remove the
    /// first `consumed` pending transactions, which it contains.
    ///
    /// Fails with `StaleBlock` when the tip moved since the candidate was
    /// prepared.
    pub fn commit_mined_block(&mut self, block: Block, consumed: usize) -> Result<()> {
        let tip = self.latest_block();
        if block.previous_hash != tip.hash || block.index != self.chain.len() as BlockIndex {
            return Err(BlockchainError::StaleBlock {
                expected_previous: block.previous_hash,
                actual_tip: tip.hash.clone(),
            });
        }

        let computed = block.compute_hash();
        if block.hash != computed {
            return Err(ChainLinkageError::HashMismatch {
                index: block.index,
                stored: block.hash,
                computed,
            }
            .into());
        }

        let consumed = consumed.min(self.pending_transactions.len());
        self.pending_transactions.drain(..consumed);

        info!(
            "📦 Block #{} appended (nonce {}, {} transactions)",
            block.index,
            block.nonce,
            block.transactions.len()
        );
        self.chain.push(block);
        Ok(())
    }

    /// Mine the pending pool plus a reward into a new block and append it
    pub fn mine_pending_transactions(&mut self, reward_address: &str, limits: &MiningLimits) -> Result<Block> {
        let consumed = self.pending_transactions.len();
        let mut candidate = self.prepare_candidate(reward_address);

        candidate.mine_with(self.config.difficulty, limits)?;
        self.commit_mined_block(candidate.clone(), consumed)?;
        Ok(candidate)
    }

    /// Balance derived by folding over every transaction in chain order
    pub fn balance_of(&self, address: &str) -> Amount {
        let mut balance = 0.0;
        for block in &self.chain {
            for tx in &block.transactions {
                if tx.from_address.as_deref() == Some(address) {
                    balance -= tx.amount;
                }
                if tx.to_address == address {
                    balance += tx.amount;
                }
            }
        }
        balance
    }

    /// Every mined transaction touching `address`, with its block index
    pub fn transactions_for_address(&self, address: &str) -> Vec<(BlockIndex, Transaction)> {
        self.chain
            .iter()
            .flat_map(|block| {
                block
                    .transactions
                    .iter()
                    .filter(|tx| tx.involves(address))
                    .map(move |tx| (block.index, tx.clone()))
            })
            .collect()
    }

    pub fn is_chain_valid(&self) -> bool {
        Self::is_valid_chain(&self.chain)
    }

    /// Check hash integrity and linkage of every block after genesis
    pub fn validate_chain(chain: &[Block]) -> std::result::Result<(), ChainLinkageError> {
        if chain.is_empty() {
            return Err(ChainLinkageError::EmptyChain);
        }

        for pair in chain.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);

            let computed = current.compute_hash();
            if current.hash != computed {
                return Err(ChainLinkageError::HashMismatch {
                    index: current.index,
                    stored: current.hash.clone(),
                    computed,
                });
            }

            if current.previous_hash != previous.hash {
                return Err(ChainLinkageError::BrokenLink {
                    index: current.index,
                    previous_hash: current.previous_hash.clone(),
                    expected: previous.hash.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn is_valid_chain(chain: &[Block]) -> bool {
        Self::validate_chain(chain).is_ok()
    }

    /// Accept a block from a peer if it extends the tip and its hash is
    /// intact. Embedded signatures are not re-verified and the pending pool
    /// is left as is.
    pub fn receive_block(&mut self, block: Block) -> std::result::Result<(), ChainLinkageError> {
        let tip = self.latest_block();
        if block.previous_hash != tip.hash {
            let err = ChainLinkageError::DoesNotExtendTip {
                index: block.index,
                previous_hash: block.previous_hash,
                tip_hash: tip.hash.clone(),
            };
            warn!("Rejected block: {} ({})", err, err.code());
            return Err(err);
        }

        let computed = block.compute_hash();
        if block.hash != computed {
            let err = ChainLinkageError::HashMismatch {
                index: block.index,
                stored: block.hash,
                computed,
            };
            warn!("Rejected block: {} ({})", err, err.code());
            return Err(err);
        }

        info!("📥 Received block #{} {}", block.index, block.hash);
        self.chain.push(block);
        Ok(())
    }

    /// Adopt `candidate` if it is strictly longer than the local chain and
    /// structurally valid. Returns whether the chain was replaced.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> bool {
        if candidate.len() <= self.chain.len() {
            debug!(
                "Candidate chain of length {} is not longer than local {}",
                candidate.len(),
                self.chain.len()
            );
            return false;
        }

        if let Err(err) = Self::validate_chain(&candidate) {
            warn!("Rejected longer chain: {} ({})", err, err.code());
            return false;
        }

        info!(
            "🔄 Replacing chain of length {} with length {}",
            self.chain.len(),
            candidate.len()
        );
        self.chain = candidate;
        true
    }

    /// Insert a peer endpoint. Returns false if it was already known.
    pub fn add_peer(&mut self, peer: impl Into<String>) -> bool {
        let peer = peer.into();
        if peer.is_empty() {
            return false;
        }
        self.peers.insert(peer)
    }

    /// Merge discovered endpoints, skipping `self_url`. Returns the ones
    /// that were new.
    pub fn merge_peers<I>(&mut self, discovered: I, self_url: Option<&str>) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut added = Vec::new();
        for peer in discovered {
            if Some(peer.as_str()) == self_url {
                continue;
            }
            if self.add_peer(peer.clone()) {
                added.push(peer);
            }
        }
        added
    }

    pub fn has_peer(&self, peer: &str) -> bool {
        self.peers.contains(peer)
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    /// Register a contract; a contract with the same id is replaced
    pub fn register_contract(&mut self, contract: Arc<dyn SmartContract>) {
        let id = contract.id().to_string();
        if self.contracts.register(contract).is_some() {
            info!("Replaced contract {}", id);
        } else {
            info!("Registered contract {}", id);
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn contracts_mut(&mut self) -> &mut ContractRegistry {
        &mut self.contracts
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new(ChainConfig::default())
    }
}
