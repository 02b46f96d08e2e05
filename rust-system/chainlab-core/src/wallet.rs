//! Wallet functionality
//!
//! A wallet holds a secp256k1 key pair. Its public key is the account
//! address used in transactions.

use crate::transaction::Transaction;
use crate::{crypto, Amount, BlockchainError, Result};
use std::path::Path;
use tracing::info;

/// Key pair holder that signs transactions
#[derive(Clone)]
pub struct Wallet {
    private_key: String,
    public_key: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

impl Wallet {
    /// Create a new wallet with a random key pair
    pub fn new() -> Self {
        let (private_key, public_key) = crypto::generate_keypair();
        Self {
            private_key,
            public_key,
        }
    }

    /// Restore a wallet from a hex private key
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let private_key = private_key.trim().to_lowercase();
        let public_key = crypto::derive_public_key(&private_key)?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Load the wallet whose private key is stored at `path`, or create a
    /// fresh one and store its key there.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(stored) => Self::from_private_key(&stored),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let wallet = Self::new();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| BlockchainError::Persistence(e.to_string()))?;
                }
                std::fs::write(path, &wallet.private_key)
                    .map_err(|e| BlockchainError::Persistence(e.to_string()))?;
                info!("🔑 Created new wallet key at {}", path.display());
                Ok(wallet)
            }
            Err(e) => Err(BlockchainError::Persistence(format!(
                "failed to read wallet key {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Attach a signature over the transaction's content hash
    pub fn sign_transaction(&self, transaction: &mut Transaction) -> Result<()> {
        let hash = transaction.compute_hash();
        let signature = crypto::sign(&self.private_key, &hash)?;
        transaction.signature = Some(signature);
        Ok(())
    }

    /// Build and sign a transfer from this wallet
    pub fn create_transaction(&self, to_address: impl Into<String>, amount: Amount) -> Result<Transaction> {
        let mut transaction = Transaction::new(self.public_key.clone(), to_address, amount);
        self.sign_transaction(&mut transaction)?;
        Ok(transaction)
    }
}
