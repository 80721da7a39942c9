use ed25519_dalek::SigningKey;
use serde::Serialize;

use std::fmt;

use super::block::{Block, BlockData};
use super::config::Config;
use super::crypto::{self, DigitalSignature};
use super::transaction::{Transaction, TransactionError};

/// A keypair plus the balance last derived from chain history
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    public_key: String,
    balance: u64,
    starting_balance: u64,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("public_key", &self.public_key)
            .field("balance", &self.balance)
            .finish()
    }
}

impl Wallet {
    /// Creates a new wallet with a random keypair and the configured starting balance
    pub fn new(config: &Config) -> Self {
        let signing_key = crypto::generate_keypair();
        let public_key = crypto::public_key_hex(&signing_key.verifying_key());
        Wallet {
            signing_key,
            public_key,
            balance: config.starting_balance,
            starting_balance: config.starting_balance,
        }
    }

    /// Gets the wallet's address (hex encoded public key)
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The balance as of the last refresh
    pub fn balance(&self) -> u64 {
        self.balance
    }

    #[cfg(test)]
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Signs the hash of `data` with the wallet's private key
    pub fn sign<T: Serialize + ?Sized>(&self, data: &T) -> DigitalSignature {
        crypto::sign(&self.signing_key, data)
    }

    /// Creates a transaction from this wallet, refreshing the balance from `chain` first when given
    ///
    /// # Arguments
    ///
    /// * `recipient` - The address receiving the funds
    /// * `amount` - The amount to transfer
    /// * `chain` - Optional chain snapshot used to recompute the balance
    ///
    /// # Returns
    ///
    /// The signed Transaction
    pub fn create_transaction(
        &mut self,
        recipient: &str,
        amount: u64,
        chain: Option<&[Block]>,
    ) -> Result<Transaction, TransactionError> {
        if let Some(chain) = chain {
            self.balance = balance_with(chain, &self.public_key, self.starting_balance);
        }

        if amount > self.balance {
            return Err(TransactionError::AmountExceedsBalance {
                amount,
                balance: self.balance,
            });
        }

        Transaction::new(self, recipient, amount)
    }

    /// Derives the balance of `address` from chain history
    ///
    /// Walks back from the tip. Once a block shows `address` spending, the outputs it
    /// received in that block and later are the whole balance; otherwise the starting
    /// balance is added to everything ever received.
    pub fn calculate_balance(chain: &[Block], address: &str, config: &Config) -> u64 {
        balance_with(chain, address, config.starting_balance)
    }
}

fn balance_with(chain: &[Block], address: &str, starting_balance: u64) -> u64 {
    let mut has_spent = false;
    let mut outputs_total: u64 = 0;

    for block in chain.iter().skip(1).rev() {
        let transactions = match &block.data {
            BlockData::Transactions(transactions) => transactions,
            _ => continue,
        };

        for transaction in transactions {
            if transaction.input.address() == address {
                has_spent = true;
            }
            if let Some(amount) = transaction.output_map.get(address) {
                outputs_total = outputs_total.saturating_add(*amount);
            }
        }

        if has_spent {
            break;
        }
    }

    if has_spent {
        outputs_total
    } else {
        starting_balance.saturating_add(outputs_total)
    }
}
