use dashmap::DashMap;
use log::{debug, warn};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::block::{Block, BlockData};
use super::config::Config;
use super::transaction::{Transaction, TransactionInput};
use super::wallet::Wallet;

/// Pending transactions keyed by id.
///
/// Single-id inserts run concurrently through the map's shard locks; bulk
/// replacement and clearing hold the outer lock exclusively so they never
/// interleave with inserts.
#[derive(Debug, Clone)]
pub struct TransactionPool {
    transactions: Arc<RwLock<DashMap<String, Transaction>>>,
    config: Arc<Config>,
}

impl TransactionPool {
    /// Creates an empty pool
    pub fn new(config: Arc<Config>) -> Self {
        TransactionPool {
            transactions: Arc::new(RwLock::new(DashMap::new())),
            config,
        }
    }

    fn shared(&self) -> RwLockReadGuard<'_, DashMap<String, Transaction>> {
        self.transactions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, DashMap<String, Transaction>> {
        self.transactions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `transaction`, replacing any pending entry with the same id
    pub fn set_transaction(&self, transaction: Transaction) {
        debug!("Pooling transaction {}", transaction.id);
        self.shared().insert(transaction.id.clone(), transaction);
    }

    /// Finds a pending transaction sent from `input_address`
    pub fn existing_transaction(&self, input_address: &str) -> Option<Transaction> {
        self.shared()
            .iter()
            .find(|entry| entry.value().input.address() == input_address)
            .map(|entry| entry.value().clone())
    }

    /// Gets a pending transaction by id
    pub fn get(&self, id: &str) -> Option<Transaction> {
        self.shared().get(id).map(|entry| entry.value().clone())
    }

    /// Pending transactions that are well formed and still match their sender's balance on `chain`
    ///
    /// # Arguments
    ///
    /// * `chain` - Snapshot of the current chain
    ///
    /// # Returns
    ///
    /// The transactions that can go into the next block; the rest stay pooled
    pub fn valid_transactions(&self, chain: &[Block]) -> Vec<Transaction> {
        self.shared()
            .iter()
            .filter_map(|entry| {
                let transaction = entry.value();
                let input = match &transaction.input {
                    TransactionInput::Signed(input) => input,
                    TransactionInput::Reward(_) => {
                        warn!("Skipping pooled reward transaction {}", transaction.id);
                        return None;
                    }
                };

                if !transaction.is_valid() {
                    warn!("Skipping invalid pooled transaction {}", transaction.id);
                    return None;
                }

                let balance = Wallet::calculate_balance(chain, &input.address, &self.config);
                if input.amount != balance {
                    warn!(
                        "Skipping pooled transaction {}: input {} no longer matches balance {}",
                        transaction.id, input.amount, balance
                    );
                    return None;
                }

                Some(transaction.clone())
            })
            .collect()
    }

    /// Replaces the whole pool with `transaction_map`.
    ///
    /// Entries are untrusted and are re-keyed by their own id; validation happens
    /// in `valid_transactions` and at block admission.
    pub fn set_map(&self, transaction_map: HashMap<String, Transaction>) {
        let transactions = self.exclusive();
        transactions.clear();
        for (_, transaction) in transaction_map {
            transactions.insert(transaction.id.clone(), transaction);
        }
    }

    /// Empties the pool
    pub fn clear(&self) {
        self.exclusive().clear();
    }

    /// Drops pending transactions that are already embedded in `chain`
    pub fn clear_blockchain_transactions(&self, chain: &[Block]) {
        let embedded: HashSet<&str> = chain
            .iter()
            .filter_map(|block| match &block.data {
                BlockData::Transactions(transactions) => Some(transactions),
                _ => None,
            })
            .flatten()
            .map(|transaction| transaction.id.as_str())
            .collect();

        self.exclusive()
            .retain(|id, _| !embedded.contains(id.as_str()));
    }

    /// Snapshot of the pool as id to transaction
    pub fn transaction_map(&self) -> HashMap<String, Transaction> {
        self.shared()
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared().is_empty()
    }
}
