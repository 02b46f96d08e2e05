//! Block persistence
//!
//! The ledger only needs three things from storage: load everything on
//! startup, append a block after it is accepted, and overwrite the whole
//! chain after a sync replaced it.

use crate::block::Block;
use crate::{utils, BlockchainError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// File holding one JSON block per line
pub const BLOCKS_FILE: &str = "blocks.jsonl";

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// All stored blocks ordered by index
    async fn load_blocks(&self) -> Result<Vec<Block>>;

    async fn save_block(&self, block: &Block) -> Result<()>;

    /// Discard stored blocks and store `blocks` instead
    async fn replace_all(&self, blocks: &[Block]) -> Result<()>;

    /// Move unusable stored data out of the way, keeping it for inspection.
    /// The store is empty afterwards.
    async fn quarantine(&self) -> Result<()>;
}

/// Volatile store for tests and throwaway nodes
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Block>>,
    quarantined: RwLock<Vec<Vec<Block>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks: RwLock::new(blocks),
            quarantined: RwLock::default(),
        }
    }

    /// Block sets moved aside by [`BlockStore::quarantine`]
    pub async fn quarantined(&self) -> Vec<Vec<Block>> {
        self.quarantined.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn load_blocks(&self) -> Result<Vec<Block>> {
        let mut blocks = self.blocks.read().await.clone();
        blocks.sort_by_key(|block| block.index);
        Ok(blocks)
    }

    async fn save_block(&self, block: &Block) -> Result<()> {
        self.blocks.write().await.push(block.clone());
        Ok(())
    }

    async fn replace_all(&self, blocks: &[Block]) -> Result<()> {
        *self.blocks.write().await = blocks.to_vec();
        Ok(())
    }

    async fn quarantine(&self) -> Result<()> {
        let blocks = std::mem::take(&mut *self.blocks.write().await);
        self.quarantined.write().await.push(blocks);
        Ok(())
    }
}

/// Append-only JSON-lines file under a data directory
#[derive(Debug)]
pub struct FileBlockStore {
    path: PathBuf,
    /// Serializes writers to the blocks file
    write_lock: Mutex<()>,
}

impl FileBlockStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(|e| {
            BlockchainError::Persistence(format!(
                "Failed to create data dir {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        info!("📁 Block store at: {}", data_dir.display());
        Ok(Self {
            path: data_dir.join(BLOCKS_FILE),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(block: &Block) -> Result<String> {
        let mut line = serde_json::to_string(block)?;
        line.push('\n');
        Ok(line)
    }
}

fn persistence_error(context: &str, path: &Path, err: std::io::Error) -> BlockchainError {
    BlockchainError::Persistence(format!("{} {}: {}", context, path.display(), err))
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn load_blocks(&self) -> Result<Vec<Block>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(persistence_error("Failed to read", &self.path, e)),
        };

        let mut blocks = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let block: Block = serde_json::from_str(line).map_err(|e| {
                BlockchainError::Persistence(format!(
                    "Corrupt block record at {}:{}: {}",
                    self.path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            blocks.push(block);
        }

        blocks.sort_by_key(|block| block.index);
        debug!("Loaded {} blocks from {}", blocks.len(), self.path.display());
        Ok(blocks)
    }

    async fn save_block(&self, block: &Block) -> Result<()> {
        let line = Self::encode(block)?;
        let _guard = self.write_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| persistence_error("Failed to open", &self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| persistence_error("Failed to append to", &self.path, e))?;
        file.flush()
            .await
            .map_err(|e| persistence_error("Failed to flush", &self.path, e))?;

        debug!("💾 Stored block #{}", block.index);
        Ok(())
    }

    async fn replace_all(&self, blocks: &[Block]) -> Result<()> {
        let mut contents = String::new();
        for block in blocks {
            contents.push_str(&Self::encode(block)?);
        }

        let _guard = self.write_lock.lock().await;
        let staging = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&staging, contents)
            .await
            .map_err(|e| persistence_error("Failed to write", &staging, e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| persistence_error("Failed to replace", &self.path, e))?;

        info!("💾 Stored replacement chain of {} blocks", blocks.len());
        Ok(())
    }

    async fn quarantine(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let target = self
            .path
            .with_extension(format!("jsonl.corrupt-{}", utils::now_millis()));

        match tokio::fs::rename(&self.path, &target).await {
            Ok(()) => {
                warn!("🚧 Moved unusable block file to {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence_error("Failed to quarantine", &self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::wallet::Wallet;
    use tempfile::TempDir;

    fn sample_chain() -> Vec<Block> {
        let genesis = Block::new(0, 0, Vec::new(), "0");
        let wallet = Wallet::new();
        let transfer = wallet.create_transaction("bob", 2.5).unwrap();
        let mut next = Block::new(
            1,
            1_700_000_000_000,
            vec![transfer, Transaction::reward("miner", 50.0)],
            genesis.hash.clone(),
        );
        next.mine(1);
        vec![genesis, next]
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlockStore::new();
        let chain = sample_chain();

        store.save_block(&chain[1]).await.unwrap();
        store.save_block(&chain[0]).await.unwrap();
        assert_eq!(store.load_blocks().await.unwrap(), chain);

        store.replace_all(&chain[..1]).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileBlockStore::new(temp_dir.path()).unwrap();
        assert!(store.load_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_preserves_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileBlockStore::new(temp_dir.path().join("node")).unwrap();
        let chain = sample_chain();

        for block in &chain {
            store.save_block(block).await.unwrap();
        }

        let reopened = FileBlockStore::new(temp_dir.path().join("node")).unwrap();
        let loaded = reopened.load_blocks().await.unwrap();

        assert_eq!(loaded, chain);
        assert!(loaded[1].has_valid_hash());
        assert!(loaded[1].transactions[0].is_valid());
    }

    #[tokio::test]
    async fn test_file_store_replace_all() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileBlockStore::new(temp_dir.path()).unwrap();
        let chain = sample_chain();

        store.save_block(&chain[0]).await.unwrap();
        store.save_block(&chain[0]).await.unwrap();
        store.replace_all(&chain).await.unwrap();

        assert_eq!(store.load_blocks().await.unwrap(), chain);
    }

    #[tokio::test]
    async fn test_file_store_quarantine_keeps_old_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileBlockStore::new(temp_dir.path()).unwrap();
        tokio::fs::write(store.path(), "{not json}\n").await.unwrap();

        store.quarantine().await.unwrap();

        assert!(store.load_blocks().await.unwrap().is_empty());
        let moved: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("blocks.jsonl.corrupt-"))
            .collect();
        assert_eq!(moved.len(), 1);

        // nothing left to move
        store.quarantine().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_quarantine() {
        let store = MemoryBlockStore::with_blocks(sample_chain());
        store.quarantine().await.unwrap();

        assert!(store.is_empty().await);
        let quarantined = store.quarantined().await;
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_reports_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileBlockStore::new(temp_dir.path()).unwrap();
        tokio::fs::write(store.path(), "{not json}\n").await.unwrap();

        let err = store.load_blocks().await.unwrap_err();
        assert_eq!(err.code(), "persistence_failure");
    }
}
