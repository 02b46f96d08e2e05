//! Smart contract hooks
//!
//! A contract is a predicate evaluated against a transaction before it is
//! admitted to the pending pool. Contracts are registered by id; an error
//! raised while evaluating one counts as a rejection.

use crate::transaction::Transaction;
use crate::{utils, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Contract code that rejects non-positive amounts
pub const RESTRICT_AMOUNT: &str = "restrictAmount";

/// Contract code of [`TimeLockContract`]
pub const TIME_LOCK: &str = "timeLock";

/// Failure raised inside a contract while evaluating a transaction
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ContractError(pub String);

pub trait SmartContract: Send + Sync {
    fn id(&self) -> &str;

    fn code(&self) -> &str;

    /// `Ok(true)` admits the transaction, `Ok(false)` declines it
    fn execute(&self, transaction: &Transaction) -> Result<bool, ContractError>;

    /// Reason reported when `execute` declines
    fn describe_rejection(&self, _transaction: &Transaction) -> String {
        format!("contract '{}' declined the transaction", self.code())
    }
}

/// Rule selected by a code string
#[derive(Debug, Clone)]
pub struct SimpleContract {
    id: String,
    code: String,
}

impl SimpleContract {
    pub fn new(id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
        }
    }

    pub fn restrict_amount(id: impl Into<String>) -> Self {
        Self::new(id, RESTRICT_AMOUNT)
    }
}

impl SmartContract for SimpleContract {
    fn id(&self) -> &str {
        &self.id
    }

    fn code(&self) -> &str {
        &self.code
    }

    fn execute(&self, transaction: &Transaction) -> Result<bool, ContractError> {
        if self.code == RESTRICT_AMOUNT {
            if transaction.amount.is_nan() {
                return Err(ContractError("amount is not a number".to_string()));
            }
            return Ok(transaction.amount > 0.0);
        }
        Ok(true)
    }

    fn describe_rejection(&self, transaction: &Transaction) -> String {
        if self.code == RESTRICT_AMOUNT {
            format!("amount must be positive, got {}", transaction.amount)
        } else {
            format!("contract '{}' declined the transaction", self.code)
        }
    }
}

/// Admits transactions only at or after `unlock_time`
#[derive(Debug, Clone)]
pub struct TimeLockContract {
    id: String,
    unlock_time: Timestamp,
}

impl TimeLockContract {
    pub fn new(id: impl Into<String>, unlock_time: Timestamp) -> Self {
        Self {
            id: id.into(),
            unlock_time,
        }
    }

    pub fn unlock_time(&self) -> Timestamp {
        self.unlock_time
    }

    pub fn execute_at(&self, now: Timestamp) -> bool {
        now >= self.unlock_time
    }
}

impl SmartContract for TimeLockContract {
    fn id(&self) -> &str {
        &self.id
    }

    fn code(&self) -> &str {
        TIME_LOCK
    }

    fn execute(&self, _transaction: &Transaction) -> Result<bool, ContractError> {
        Ok(self.execute_at(utils::now_millis()))
    }

    fn describe_rejection(&self, _transaction: &Transaction) -> String {
        format!("locked until {}", self.unlock_time)
    }
}

/// Rejection produced by [`ContractRegistry::evaluate`]
#[derive(Debug, Clone, PartialEq)]
pub struct ContractRejection {
    pub contract_id: String,
    pub reason: String,
}

/// Contracts keyed by id
#[derive(Clone, Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, Arc<dyn SmartContract>>,
}

impl std::fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.contracts.keys()).finish()
    }
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract, replacing any contract with the same id
    pub fn register(&mut self, contract: Arc<dyn SmartContract>) -> Option<Arc<dyn SmartContract>> {
        self.contracts.insert(contract.id().to_string(), contract)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn SmartContract>> {
        self.contracts.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn SmartContract>> {
        self.contracts.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.contracts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Every registered contract must admit the transaction, checked in id order
    pub fn evaluate(&self, transaction: &Transaction) -> Result<(), ContractRejection> {
        for (id, contract) in &self.contracts {
            match contract.execute(transaction) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ContractRejection {
                        contract_id: id.clone(),
                        reason: contract.describe_rejection(transaction),
                    });
                }
                Err(e) => {
                    warn!("Contract execution failed for {}: {}", id, e);
                    return Err(ContractRejection {
                        contract_id: id.clone(),
                        reason: format!("contract execution failed: {}", e),
                    });
                }
            }
        }
        Ok(())
    }
}
