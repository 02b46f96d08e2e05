//! Node state kept between CLI invocations
//!
//! Blocks live in the block store. The peer set and the pending pool are
//! only held in memory by the ledger, so the CLI saves them here after each
//! command and restores them on the next start.

use anyhow::{Context, Result};
use chainlab_core::{LedgerNode, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeState {
    pub peers: Vec<String>,
    pub pending_transactions: Vec<Transaction>,
}

impl NodeState {
    pub async fn read(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Invalid node state in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub async fn capture(node: &LedgerNode) -> Self {
        Self {
            peers: node.peers().await,
            pending_transactions: node.pending_transactions().await,
        }
    }

    /// Feed saved peers and pending transactions back into `node`.
    /// Transactions the ledger no longer admits are dropped, and so is the
    /// node's own URL if it was saved under a different configuration.
    pub async fn restore(self, node: &LedgerNode) {
        let self_url = node.config().self_url.clone();
        let peers = self.peers;
        node.with_ledger(|ledger| ledger.merge_peers(peers, self_url.as_deref()))
            .await;

        let mut restored = 0;
        for transaction in self.pending_transactions {
            match node.submit_transaction(transaction).await {
                Ok(()) => restored += 1,
                Err(e) => warn!("Dropping saved pending transaction: {}", e),
            }
        }
        debug!("Restored {} pending transactions", restored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainlab_core::{ChainConfig, MemoryBlockStore, NodeConfig, PeerError, PeerTransport, Wallet};
    use chainlab_core::Block;
    use std::sync::Arc;

    struct NoPeers;

    #[async_trait::async_trait]
    impl PeerTransport for NoPeers {
        async fn fetch_chain(&self, peer: &str) -> std::result::Result<Vec<Block>, PeerError> {
            Err(PeerError::BadStatus { peer: peer.to_string(), status: 503 })
        }

        async fn fetch_peers(&self, peer: &str) -> std::result::Result<Vec<String>, PeerError> {
            Err(PeerError::BadStatus { peer: peer.to_string(), status: 503 })
        }

        async fn send_block(&self, peer: &str, _block: &Block) -> std::result::Result<(), PeerError> {
            Err(PeerError::BadStatus { peer: peer.to_string(), status: 503 })
        }
    }

    async fn fresh_node() -> LedgerNode {
        let config = NodeConfig {
            chain: ChainConfig { difficulty: 1, ..ChainConfig::default() },
            ..NodeConfig::default()
        };
        LedgerNode::start(config, Arc::new(NoPeers), Arc::new(MemoryBlockStore::new())).await
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let wallet = Wallet::new();

        let node = fresh_node().await;
        node.with_ledger(|ledger| ledger.add_peer("http://peer:3000")).await;
        node.submit_transaction(wallet.create_transaction("bob", 1.0).unwrap())
            .await
            .unwrap();
        NodeState::capture(&node).await.write(&path).await.unwrap();

        let restarted = fresh_node().await;
        NodeState::read(&path).await.unwrap().restore(&restarted).await;

        assert_eq!(restarted.peers().await, vec!["http://peer:3000".to_string()]);
        assert_eq!(restarted.pending_transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_saved_transactions_are_dropped() {
        let state = NodeState {
            peers: Vec::new(),
            pending_transactions: vec![Transaction::new("alice", "bob", 1.0)],
        };
        let node = fresh_node().await;
        state.restore(&node).await;

        assert!(node.pending_transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_skips_own_url() {
        let config = NodeConfig {
            self_url: Some("http://me:3000".to_string()),
            chain: ChainConfig { difficulty: 1, ..ChainConfig::default() },
            ..NodeConfig::default()
        };
        let node = LedgerNode::start(config, Arc::new(NoPeers), Arc::new(MemoryBlockStore::new())).await;
        let state = NodeState {
            peers: vec![
                "http://me:3000".to_string(),
                "http://peer:3000".to_string(),
                String::new(),
            ],
            pending_transactions: Vec::new(),
        };

        state.restore(&node).await;

        assert_eq!(node.peers().await, vec!["http://peer:3000".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = NodeState::read(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(state, NodeState::default());
    }
}
