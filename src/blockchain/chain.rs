use log::{error, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use super::block::{mine_block_cancellable, Block, BlockData};
use super::config::Config;
use super::transaction::{Transaction, TransactionInput, TransactionViolation};
use super::wallet::Wallet;

/// Errors that can occur while extending the chain
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Mining was cancelled")]
    MiningCancelled,

    #[error("Chain tip moved while mining: expected {expected}, found {actual}")]
    StaleTip { expected: String, actual: String },
}

/// Reasons a chain fails structural validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainViolation {
    #[error("Chain is empty")]
    Empty,

    #[error("Chain does not start with the genesis block")]
    GenesisMismatch,

    #[error("Block {index} carries a genesis payload")]
    MisplacedGenesis { index: usize },

    #[error("Block {index} does not link to its predecessor")]
    BrokenLink { index: usize },

    #[error("Block {index} hash does not match its contents")]
    HashMismatch { index: usize },

    #[error("Block {index} hash does not meet difficulty {difficulty}")]
    InsufficientWork { index: usize, difficulty: u32 },

    #[error("Block {index} has zero difficulty")]
    ZeroDifficulty { index: usize },

    #[error("Block {index} difficulty jumps from {from} to {to}")]
    DifficultyJump { index: usize, from: u32, to: u32 },
}

/// Reasons the transactions embedded in a chain are rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionDataViolation {
    #[error("Block {index} has {count} reward transactions, expected exactly one")]
    RewardCount { index: usize, count: usize },

    #[error("Block {index} reward transaction {id} is malformed")]
    InvalidReward { index: usize, id: String },

    #[error("Block {index} transaction {id}: {violation}")]
    InvalidTransaction {
        index: usize,
        id: String,
        violation: TransactionViolation,
    },

    #[error("Block {index} transaction {id} claims input {claimed}, sender balance was {actual}")]
    IncorrectInputAmount {
        index: usize,
        id: String,
        claimed: u64,
        actual: u64,
    },

    #[error("Block {index} contains transaction {id} more than once")]
    DuplicateTransaction { index: usize, id: String },
}

/// Result of offering a candidate chain to `replace_chain`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced,
    NotLonger,
    InvalidChain,
    InvalidTransactionData,
}

/// Represents the blockchain
#[derive(Debug, Clone)]
pub struct Blockchain {
    /// The chain of blocks
    chain: Arc<RwLock<Vec<Block>>>,

    /// Serializes block production
    mining: Arc<Mutex<()>>,

    /// Cancellation flag of the block being mined, published while the producer lock is held
    mining_job: Arc<Mutex<Option<Arc<AtomicBool>>>>,

    /// Tunable constants
    config: Arc<Config>,
}

impl Blockchain {
    /// Creates a new blockchain holding only the genesis block
    pub fn new(config: Arc<Config>) -> Self {
        Blockchain {
            chain: Arc::new(RwLock::new(vec![Block::genesis(&config)])),
            mining: Arc::new(Mutex::new(())),
            mining_job: Arc::new(Mutex::new(None)),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Block>> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Block>> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn mining_job(&self) -> MutexGuard<'_, Option<Arc<AtomicBool>>> {
        self.mining_job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets a consistent snapshot of the entire chain
    pub fn chain(&self) -> Vec<Block> {
        self.read().clone()
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Gets the last block in the chain
    pub fn last_block(&self) -> Block {
        self.read()
            .last()
            .cloned()
            .unwrap_or_else(|| Block::genesis(&self.config))
    }

    /// Mines `data` on top of the current tip and appends the block
    ///
    /// # Arguments
    ///
    /// * `data` - The payload of the new block
    ///
    /// # Returns
    ///
    /// The newly mined block, `MiningCancelled` if `cancel_mining` interrupted it,
    /// or `StaleTip` if the chain was replaced meanwhile
    pub fn add_block(&self, data: BlockData) -> Result<Block, BlockchainError> {
        self.add_block_cancellable(data, Arc::new(AtomicBool::new(false)))
    }

    /// Like `add_block`, but also stops mining once `cancel` is set
    pub fn add_block_cancellable(
        &self,
        data: BlockData,
        cancel: Arc<AtomicBool>,
    ) -> Result<Block, BlockchainError> {
        let _producer = self.mining.lock().unwrap_or_else(PoisonError::into_inner);

        // Published before the tip is read, so a replacement followed by
        // `cancel_mining` always reaches a job still working on the old tip.
        *self.mining_job() = Some(cancel.clone());
        let result = self.mine_on_tip(data, &cancel);
        *self.mining_job() = None;

        result
    }

    fn mine_on_tip(&self, data: BlockData, cancel: &AtomicBool) -> Result<Block, BlockchainError> {
        // Mine without holding the chain lock so readers are not blocked.
        let last_block = self.last_block();
        let block = mine_block_cancellable(&last_block, data, &self.config, cancel)
            .ok_or(BlockchainError::MiningCancelled)?;

        self.append(&last_block, block)
    }

    fn append(&self, parent: &Block, block: Block) -> Result<Block, BlockchainError> {
        let mut chain = self.write();
        let tip = chain.last().map(|b| b.hash.clone()).unwrap_or_default();
        if tip != parent.hash {
            warn!("Discarding block mined on {}: tip is now {}", parent.hash, tip);
            return Err(BlockchainError::StaleTip {
                expected: parent.hash.clone(),
                actual: tip,
            });
        }

        chain.push(block.clone());
        Ok(block)
    }

    /// Stops the block currently being mined, if any
    ///
    /// Jobs still waiting for their turn to mine are not affected.
    pub fn cancel_mining(&self) {
        if let Some(cancel) = self.mining_job().as_ref() {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a block is being mined right now
    pub fn is_mining(&self) -> bool {
        self.mining_job().is_some()
    }

    /// Replaces the chain if `candidate` is longer and valid
    pub fn replace_chain(&self, candidate: Vec<Block>, validate_transactions: bool) -> ReplaceOutcome {
        self.replace_chain_with(candidate, validate_transactions, |_| {})
    }

    /// Replaces the chain if `candidate` is longer and valid, then calls `on_success`
    ///
    /// # Arguments
    ///
    /// * `candidate` - Untrusted chain received from a peer
    /// * `validate_transactions` - Also check every block's transaction data
    /// * `on_success` - Called with the new chain after the swap
    ///
    /// # Returns
    ///
    /// What happened to the candidate; rejections are logged and leave the chain untouched
    pub fn replace_chain_with<F>(
        &self,
        candidate: Vec<Block>,
        validate_transactions: bool,
        on_success: F,
    ) -> ReplaceOutcome
    where
        F: FnOnce(&[Block]),
    {
        if candidate.len() <= self.len() {
            error!("The incoming chain must be longer");
            return ReplaceOutcome::NotLonger;
        }

        if !Self::is_valid_chain(&candidate, &self.config) {
            error!("The incoming chain must be valid");
            return ReplaceOutcome::InvalidChain;
        }

        if validate_transactions && !Self::validate_transaction_data(&candidate, &self.config) {
            error!("The incoming chain has invalid transaction data");
            return ReplaceOutcome::InvalidTransactionData;
        }

        {
            let mut chain = self.write();
            // The chain may have grown while the candidate was being validated.
            if candidate.len() <= chain.len() {
                error!("The incoming chain must be longer");
                return ReplaceOutcome::NotLonger;
            }
            info!(
                "Replacing chain of {} blocks with {} blocks",
                chain.len(),
                candidate.len()
            );
            *chain = candidate;
        }

        let snapshot = self.chain();
        on_success(snapshot.as_slice());
        ReplaceOutcome::Replaced
    }

    /// Checks linkage, hashes, proof of work and difficulty steps of `chain`
    pub fn check_chain(chain: &[Block], config: &Config) -> Result<(), ChainViolation> {
        let genesis = chain.first().ok_or(ChainViolation::Empty)?;
        if *genesis != Block::genesis(config) {
            return Err(ChainViolation::GenesisMismatch);
        }

        for (index, pair) in chain.windows(2).enumerate() {
            let (previous, block) = (&pair[0], &pair[1]);
            let index = index + 1;

            if block.data == BlockData::Genesis {
                return Err(ChainViolation::MisplacedGenesis { index });
            }

            if block.last_hash != previous.hash {
                return Err(ChainViolation::BrokenLink { index });
            }

            if block.calculate_hash() != block.hash {
                return Err(ChainViolation::HashMismatch { index });
            }

            if block.difficulty == 0 {
                return Err(ChainViolation::ZeroDifficulty { index });
            }

            if !block.meets_difficulty() {
                return Err(ChainViolation::InsufficientWork {
                    index,
                    difficulty: block.difficulty,
                });
            }

            if previous.difficulty.abs_diff(block.difficulty) > 1 {
                return Err(ChainViolation::DifficultyJump {
                    index,
                    from: previous.difficulty,
                    to: block.difficulty,
                });
            }
        }

        Ok(())
    }

    /// Validates `chain`, logging the first violation found
    pub fn is_valid_chain(chain: &[Block], config: &Config) -> bool {
        match Self::check_chain(chain, config) {
            Ok(()) => true,
            Err(violation) => {
                error!("Invalid chain: {}", violation);
                false
            }
        }
    }

    /// Checks reward, signature, funding and uniqueness rules for every non-genesis block
    pub fn check_transaction_data(
        chain: &[Block],
        config: &Config,
    ) -> Result<(), TransactionDataViolation> {
        for (index, block) in chain.iter().enumerate().skip(1) {
            let transactions: &[Transaction] = match &block.data {
                BlockData::Transactions(transactions) => transactions.as_slice(),
                _ => &[],
            };

            let reward_count = transactions.iter().filter(|t| t.is_reward()).count();
            if reward_count != 1 {
                return Err(TransactionDataViolation::RewardCount {
                    index,
                    count: reward_count,
                });
            }

            let mut seen = HashSet::new();
            for transaction in transactions {
                match &transaction.input {
                    TransactionInput::Reward(input) => {
                        let amounts: Vec<u64> = transaction.output_map.values().copied().collect();
                        if input.address != config.reward_input_address
                            || amounts != [config.mining_reward]
                        {
                            return Err(TransactionDataViolation::InvalidReward {
                                index,
                                id: transaction.id.clone(),
                            });
                        }
                    }
                    TransactionInput::Signed(input) => {
                        transaction.check_valid().map_err(|violation| {
                            TransactionDataViolation::InvalidTransaction {
                                index,
                                id: transaction.id.clone(),
                                violation,
                            }
                        })?;

                        let actual = Wallet::calculate_balance(&chain[..index], &input.address, config);
                        if input.amount != actual {
                            return Err(TransactionDataViolation::IncorrectInputAmount {
                                index,
                                id: transaction.id.clone(),
                                claimed: input.amount,
                                actual,
                            });
                        }
                    }
                }

                if !seen.insert(transaction.id.as_str()) {
                    return Err(TransactionDataViolation::DuplicateTransaction {
                        index,
                        id: transaction.id.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Validates the transaction data of `chain`, logging the first violation found
    pub fn validate_transaction_data(chain: &[Block], config: &Config) -> bool {
        match Self::check_transaction_data(chain, config) {
            Ok(()) => true,
            Err(violation) => {
                error!("Invalid transaction data: {}", violation);
                false
            }
        }
    }
}
