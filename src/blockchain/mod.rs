// Blockchain module
//
// This module contains the consensus and data-integrity core:
// - Tunable configuration
// - Hashing and signature primitives
// - Block structure and proof of work
// - Chain validation and fork choice
// - Transactions, the transaction pool and wallets

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod pool;
pub mod transaction;
pub mod wallet;

// Re-export main components for easier access
pub use block::{Block, BlockData};
pub use chain::{Blockchain, BlockchainError, ReplaceOutcome};
pub use config::Config;
pub use crypto::DigitalSignature;
pub use pool::TransactionPool;
pub use transaction::{Transaction, TransactionError, TransactionInput};
pub use wallet::Wallet;
