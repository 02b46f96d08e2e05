//! Blocks and proof-of-work
//!
//! A block packages an ordered list of transactions together with the hash
//! of its predecessor. Its own hash covers
//! `index ++ previousHash ++ timestamp ++ JSON(transactions) ++ nonce`,
//! and mining searches for a nonce whose hash starts with `difficulty`
//! hex zeros.

use crate::transaction::Transaction;
use crate::{crypto, BlockIndex, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the mining loop polls its cancellation token
const CANCEL_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum MiningError {
    #[error("mining cancelled after {attempts} attempts")]
    Cancelled { attempts: u64 },

    #[error("no valid nonce found within {attempts} attempts")]
    IterationBudgetExhausted { attempts: u64 },

    #[error("mining worker failed: {reason}")]
    WorkerFailed { reason: String },
}

/// Bounds on a proof-of-work search. The default is unbounded.
#[derive(Debug, Clone, Default)]
pub struct MiningLimits {
    pub max_iterations: Option<u64>,
    pub cancel: Option<CancellationToken>,
}

impl MiningLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |token| token.is_cancelled())
    }
}

/// Outcome of a successful proof-of-work search
#[derive(Debug, Clone)]
pub struct MiningStats {
    pub attempts: u64,
    pub elapsed: Duration,
}

impl MiningStats {
    pub fn hash_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.attempts as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: BlockIndex,
    pub timestamp: Timestamp,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
}

/// Short description of a block for callers of the mining trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub index: BlockIndex,
    pub hash: String,
    pub transaction_count: usize,
}

impl Block {
    /// Create an unmined block (nonce 0) with its initial hash
    pub fn new(
        index: BlockIndex,
        timestamp: Timestamp,
        transactions: Vec<Transaction>,
        previous_hash: impl Into<String>,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp,
            transactions,
            previous_hash: previous_hash.into(),
            hash: String::new(),
            nonce: 0,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> String {
        crypto::sha256_hex(&format!("{}{}", self.hash_prefix(), self.nonce))
    }

    /// Everything the hash covers except the nonce
    fn hash_prefix(&self) -> String {
        // Serializing plain string/number records cannot fail
        let transactions = serde_json::to_string(&self.transactions).unwrap_or_default();
        format!(
            "{}{}{}{}",
            self.index, self.previous_hash, self.timestamp, transactions
        )
    }

    /// The stored hash matches the block contents
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// The stored hash starts with `difficulty` hex zeros
    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        self.hash.len() >= difficulty && self.hash.bytes().take(difficulty).all(|b| b == b'0')
    }

    /// Search for a nonce with no bound on the number of attempts
    pub fn mine(&mut self, difficulty: usize) -> MiningStats {
        let started = Instant::now();
        let prefix = self.hash_prefix();
        let mut attempts = 0u64;

        while !self.meets_difficulty(difficulty) {
            self.nonce += 1;
            self.hash = crypto::sha256_hex(&format!("{}{}", prefix, self.nonce));
            attempts += 1;
        }

        info!("⛏️  Block mined: {}", self.hash);
        MiningStats {
            attempts,
            elapsed: started.elapsed(),
        }
    }

    /// Search for a nonce, giving up when `limits` say so
    pub fn mine_with(&mut self, difficulty: usize, limits: &MiningLimits) -> Result<MiningStats, MiningError> {
        let started = Instant::now();
        let prefix = self.hash_prefix();
        let mut attempts = 0u64;

        while !self.meets_difficulty(difficulty) {
            if let Some(max_iterations) = limits.max_iterations {
                if attempts >= max_iterations {
                    debug!("Mining budget of {} attempts exhausted", max_iterations);
                    return Err(MiningError::IterationBudgetExhausted { attempts });
                }
            }
            if attempts % CANCEL_CHECK_INTERVAL == 0 && limits.is_cancelled() {
                return Err(MiningError::Cancelled { attempts });
            }

            self.nonce += 1;
            self.hash = crypto::sha256_hex(&format!("{}{}", prefix, self.nonce));
            attempts += 1;
        }

        info!("⛏️  Block mined: {}", self.hash);
        Ok(MiningStats {
            attempts,
            elapsed: started.elapsed(),
        })
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            index: self.index,
            hash: self.hash.clone(),
            transaction_count: self.transactions.len(),
        }
    }
}
