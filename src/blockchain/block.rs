use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use std::sync::atomic::{AtomicBool, Ordering};

use super::config::Config;
use super::crypto::count_leading_zero_bits;
use super::transaction::Transaction;

const GENESIS_TIMESTAMP: i64 = 1;
const GENESIS_LAST_HASH: &str = "-----";
const GENESIS_HASH: &str = "hash-one";

/// How often the mining loop polls its cancellation flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Payload carried by a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum BlockData {
    /// The empty payload of the genesis block
    Genesis,

    /// Ledger transactions, one of which rewards the miner
    Transactions(Vec<Transaction>),

    /// Any other JSON payload
    Arbitrary(serde_json::Value),
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Milliseconds since the epoch when the block was sealed
    pub timestamp: i64,

    /// Hash of the previous block
    pub last_hash: String,

    /// Hash of the current block
    pub hash: String,

    /// Payload of the block
    pub data: BlockData,

    /// Proof of work counter
    pub nonce: u64,

    /// Required leading zero bits of `hash`
    pub difficulty: u32,
}

impl Block {
    /// The fixed first block of every chain
    pub fn genesis(config: &Config) -> Self {
        Block {
            timestamp: GENESIS_TIMESTAMP,
            last_hash: GENESIS_LAST_HASH.to_string(),
            hash: GENESIS_HASH.to_string(),
            data: BlockData::Genesis,
            nonce: 0,
            difficulty: config.initial_difficulty,
        }
    }

    /// Recomputes the hash over the block's own fields
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        crate::crypto_hash!(
            self.timestamp,
            self.last_hash,
            self.difficulty,
            self.nonce,
            self.data
        )
    }

    /// Checks that `hash` has at least `difficulty` leading zero bits
    pub fn meets_difficulty(&self) -> bool {
        count_leading_zero_bits(&self.hash) >= self.difficulty
    }
}

/// Difficulty for a block following `last_block` and sealed at `timestamp`.
///
/// Slower than the mine rate lowers it by one, otherwise it rises by one; never below 1.
pub fn adjust_difficulty(last_block: &Block, timestamp: i64, config: &Config) -> u32 {
    let elapsed = timestamp.saturating_sub(last_block.timestamp);
    let difficulty = if elapsed > config.mine_rate_ms {
        last_block.difficulty.saturating_sub(1)
    } else {
        last_block.difficulty.saturating_add(1)
    };
    difficulty.max(1)
}

/// Mines a block on top of `last_block`.
///
/// The search runs until a hash meets the difficulty and cannot be interrupted;
/// use `mine_block_cancellable` from workers that may need to abandon a stale parent.
pub fn mine_block(last_block: &Block, data: BlockData, config: &Config) -> Block {
    let never = AtomicBool::new(false);
    loop {
        if let Some(block) = mine_block_cancellable(last_block, data.clone(), config, &never) {
            return block;
        }
    }
}

/// Mines a block on top of `last_block`, giving up once `cancel` is set
///
/// # Arguments
///
/// * `last_block` - The current tip
/// * `data` - The payload to seal
/// * `config` - Supplies the mine rate used for retargeting
/// * `cancel` - Polled periodically; when true the search stops
///
/// # Returns
///
/// The sealed block, or `None` if mining was cancelled
pub fn mine_block_cancellable(
    last_block: &Block,
    data: BlockData,
    config: &Config,
    cancel: &AtomicBool,
) -> Option<Block> {
    let started = now_millis();
    let mut nonce: u64 = 0;

    loop {
        nonce = nonce.wrapping_add(1);
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            debug!("Mining on top of {} cancelled after {} attempts", last_block.hash, nonce);
            return None;
        }

        let timestamp = now_millis();
        let difficulty = adjust_difficulty(last_block, timestamp, config);
        let hash = crate::crypto_hash!(timestamp, last_block.hash, difficulty, nonce, data);

        if count_leading_zero_bits(&hash) >= difficulty {
            info!(
                "Mined block {} with nonce {} at difficulty {} in {}ms",
                hash,
                nonce,
                difficulty,
                timestamp - started
            );
            return Some(Block {
                timestamp,
                last_hash: last_block.hash.clone(),
                hash,
                data,
                nonce,
                difficulty,
            });
        }
    }
}
