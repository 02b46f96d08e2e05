//! Chainlab ledger core
//!
//! An append-only block ledger with proof-of-work mining, secp256k1-signed
//! value transfers, pluggable contract gating and longest-valid-chain
//! synchronization between peers.

use serde::Serialize;

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Transfer amount (decimal, as on the wire)
pub type Amount = f64;

/// Position of a block in the chain, genesis is 0
pub type BlockIndex = u64;

/// Error types for ledger operations
#[derive(Debug, thiserror::Error, Serialize)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Contract {contract_id} rejected transaction: {reason}")]
    ContractRejected { contract_id: String, reason: String },

    #[error("Chain linkage error: {0}")]
    ChainLinkage(#[from] blockchain::ChainLinkageError),

    #[error("Mining aborted: {0}")]
    Mining(#[from] block::MiningError),

    #[error("Mined block is stale: expected tip {expected_previous}, actual tip {actual_tip}")]
    StaleBlock {
        expected_previous: String,
        actual_tip: String,
    },

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BlockchainError {
    /// Stable reason code for calling layers
    pub fn code(&self) -> &'static str {
        match self {
            BlockchainError::InvalidTransaction(_) => "invalid_transaction",
            BlockchainError::InvalidSignature(_) => "invalid_signature",
            BlockchainError::ContractRejected { .. } => "contract_rejected",
            BlockchainError::ChainLinkage(_) => "chain_linkage",
            BlockchainError::Mining(_) => "mining_aborted",
            BlockchainError::StaleBlock { .. } => "stale_block",
            BlockchainError::Persistence(_) => "persistence_failure",
            BlockchainError::Network(_) => "network_error",
            BlockchainError::Crypto(_) => "crypto_error",
            BlockchainError::InvalidPrivateKey(_) => "invalid_private_key",
            BlockchainError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the caller can fix the failure by changing its request
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BlockchainError::InvalidTransaction(_)
                | BlockchainError::InvalidSignature(_)
                | BlockchainError::ContractRejected { .. }
        )
    }
}

impl From<serde_json::Error> for BlockchainError {
    fn from(err: serde_json::Error) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Utility functions
pub mod utils {
    use super::Timestamp;

    /// Current wall-clock time in milliseconds
    pub fn now_millis() -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

pub mod crypto;
pub mod transaction;
pub mod wallet;
pub mod contracts;
pub mod block;
pub mod blockchain;
pub mod peer;
pub mod storage;
pub mod node;

pub use block::{Block, BlockSummary, MiningLimits, MiningStats};
pub use blockchain::{Blockchain, ChainConfig, ChainLinkageError};
pub use contracts::{ContractRegistry, SimpleContract, SmartContract, TimeLockContract};
pub use node::{LedgerNode, NodeConfig};
pub use peer::{HttpPeerTransport, PeerError, PeerOutcome, PeerTransport};
pub use storage::{BlockStore, FileBlockStore, MemoryBlockStore};
pub use transaction::{Transaction, TransactionRequest};
pub use wallet::Wallet;
