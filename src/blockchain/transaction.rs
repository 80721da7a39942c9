use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::collections::BTreeMap;

use super::block::now_millis;
use super::config::Config;
use super::crypto::{verify_signature, DigitalSignature};
use super::wallet::Wallet;

/// Recipient address to amount. Ordered so that hashing and signing are deterministic.
pub type OutputMap = BTreeMap<String, u64>;

/// Errors that can occur while building or updating a transaction
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Amount exceeds balance: amount {amount}, balance {balance}")]
    AmountExceedsBalance { amount: u64, balance: u64 },

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Reward transactions cannot be updated")]
    RewardNotUpdatable,

    #[error("Update of {amount} to {recipient} leaves the outputs unchanged")]
    UnchangedOutputs { recipient: String, amount: u64 },
}

/// Reasons a transaction fails validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionViolation {
    #[error("Invalid transaction from {address}: output total {output_total:?} does not match input amount {input_amount}")]
    OutputMismatch {
        address: String,
        output_total: Option<u64>,
        input_amount: u64,
    },

    #[error("Invalid signature from {0}")]
    InvalidSignature(String),

    #[error("Reward transactions are not signed")]
    UnsignedReward,
}

/// Input of an ordinary, signed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedInput {
    /// Milliseconds since the epoch at the last (re)signing
    pub timestamp: i64,

    /// The sender's balance at signing time
    pub amount: u64,

    /// The sender's public key (hex)
    pub address: String,

    /// Signature over the output map
    pub signature: DigitalSignature,
}

/// Fixed, unsigned input of a mining reward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardInput {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionInput {
    Signed(SignedInput),
    Reward(RewardInput),
}

impl TransactionInput {
    pub fn address(&self) -> &str {
        match self {
            TransactionInput::Signed(input) => &input.address,
            TransactionInput::Reward(input) => &input.address,
        }
    }
}

/// Represents a transfer of funds, split across the recipients in `output_map`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique identifier for the transaction
    pub id: String,

    /// Amount allocated to each address, including the sender's change
    pub output_map: OutputMap,

    /// Who is spending and the proof that they agreed to it
    pub input: TransactionInput,
}

impl Transaction {
    /// Creates a new signed transaction spending from `sender`
    ///
    /// # Arguments
    ///
    /// * `sender` - The wallet paying for the transfer
    /// * `recipient` - The address receiving `amount`
    /// * `amount` - The amount to transfer
    ///
    /// # Returns
    ///
    /// A new Transaction, or `AmountExceedsBalance` if the wallet cannot cover it
    pub fn new(sender: &Wallet, recipient: &str, amount: u64) -> Result<Self, TransactionError> {
        let balance = sender.balance();
        if amount > balance {
            return Err(TransactionError::AmountExceedsBalance { amount, balance });
        }

        let mut output_map = OutputMap::new();
        output_map.insert(recipient.to_string(), amount);
        // A transfer to oneself collapses into a single entry holding the full balance.
        output_map.insert(sender.public_key().to_string(), balance - amount);

        let input = Self::signed_input(sender, balance, &output_map);

        Ok(Transaction {
            id: Uuid::new_v4().to_string(),
            output_map,
            input,
        })
    }

    /// Creates the reward transaction crediting `miner` for a block
    pub fn reward(miner: &Wallet, config: &Config) -> Self {
        Self::reward_to(miner.public_key(), config)
    }

    /// Creates a reward transaction crediting an arbitrary address
    pub fn reward_to(address: &str, config: &Config) -> Self {
        let mut output_map = OutputMap::new();
        output_map.insert(address.to_string(), config.mining_reward);

        Transaction {
            id: Uuid::new_v4().to_string(),
            output_map,
            input: TransactionInput::Reward(RewardInput {
                address: config.reward_input_address.clone(),
            }),
        }
    }

    /// Adds another transfer to a still-pending transaction and re-signs it
    ///
    /// A zero amount, or a transfer back to the sender's own address, would leave the
    /// output map (and so the signature) as it was and is rejected as `UnchangedOutputs`.
    ///
    /// # Arguments
    ///
    /// * `sender` - The wallet that signed the original transaction
    /// * `recipient` - The address receiving `amount`
    /// * `amount` - The amount to take from the sender's remaining output
    pub fn update(
        &mut self,
        sender: &Wallet,
        recipient: &str,
        amount: u64,
    ) -> Result<(), TransactionError> {
        let input_amount = match &self.input {
            TransactionInput::Signed(input) if input.address == sender.public_key() => input.amount,
            TransactionInput::Signed(input) => {
                return Err(TransactionError::InvalidSenderAddress(input.address.clone()))
            }
            TransactionInput::Reward(_) => return Err(TransactionError::RewardNotUpdatable),
        };

        if amount == 0 || recipient == sender.public_key() {
            return Err(TransactionError::UnchangedOutputs {
                recipient: recipient.to_string(),
                amount,
            });
        }

        let remaining = self
            .output_map
            .get(sender.public_key())
            .copied()
            .unwrap_or(0);
        if amount > remaining {
            return Err(TransactionError::AmountExceedsBalance {
                amount,
                balance: remaining,
            });
        }

        *self.output_map.entry(recipient.to_string()).or_insert(0) += amount;
        if let Some(sender_output) = self.output_map.get_mut(sender.public_key()) {
            *sender_output -= amount;
        }

        self.input = Self::signed_input(sender, input_amount, &self.output_map);
        Ok(())
    }

    fn signed_input(sender: &Wallet, amount: u64, output_map: &OutputMap) -> TransactionInput {
        TransactionInput::Signed(SignedInput {
            timestamp: now_millis(),
            amount,
            address: sender.public_key().to_string(),
            signature: sender.sign(output_map),
        })
    }

    /// Checks if the transaction carries the reward input
    pub fn is_reward(&self) -> bool {
        matches!(self.input, TransactionInput::Reward(_))
    }

    /// Sum of all outputs, or `None` on overflow
    pub fn output_total(&self) -> Option<u64> {
        self.output_map
            .values()
            .try_fold(0u64, |total, amount| total.checked_add(*amount))
    }

    /// Checks the output total against the input amount and verifies the signature
    pub fn check_valid(&self) -> Result<(), TransactionViolation> {
        let input = match &self.input {
            TransactionInput::Signed(input) => input,
            TransactionInput::Reward(_) => return Err(TransactionViolation::UnsignedReward),
        };

        let output_total = self.output_total();
        if output_total != Some(input.amount) {
            return Err(TransactionViolation::OutputMismatch {
                address: input.address.clone(),
                output_total,
                input_amount: input.amount,
            });
        }

        if !verify_signature(&input.address, &self.output_map, &input.signature) {
            return Err(TransactionViolation::InvalidSignature(input.address.clone()));
        }

        Ok(())
    }

    /// Validates an ordinary transaction, logging the reason when it is rejected
    pub fn is_valid(&self) -> bool {
        match self.check_valid() {
            Ok(()) => true,
            Err(violation) => {
                error!("{}", violation);
                false
            }
        }
    }
}
