//! A minimal proof-of-work ledger.
//!
//! `blockchain` holds the consensus core: hashing and signatures, blocks and
//! mining, chain validation with longest-valid-chain replacement, signed
//! transactions, the transaction pool and wallet balances. `node` wires those
//! pieces together for a serving layer and a peer transport.

pub mod blockchain;
pub mod node;
