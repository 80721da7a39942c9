// Node module
//
// Glue between the ledger core and whatever serves it: submitting wallet
// transactions, mining the pool on a blocking worker, and ingesting chains and
// pools received from peers. Transport is left to the `Broadcaster` implementation.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::blockchain::{
    Block, BlockData, Blockchain, BlockchainError, Config, ReplaceOutcome, Transaction,
    TransactionError, TransactionPool, Wallet,
};

/// Errors that can occur while serving node requests
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Mining worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Messages exchanged with peers, one per pub/sub channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeMessage {
    Blockchain(Vec<Block>),
    Transaction(Transaction),
}

/// Fire-and-forget hook used to announce new state to peers
pub trait Broadcaster: Send + Sync {
    fn broadcast_chain(&self, chain: &[Block]);
    fn broadcast_transaction(&self, transaction: &Transaction);
}

/// Broadcaster for a node with no peers
#[derive(Debug, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast_chain(&self, _chain: &[Block]) {}
    fn broadcast_transaction(&self, _transaction: &Transaction) {}
}

/// Broadcaster that hands messages to a transport task over a channel
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: UnboundedSender<NodeMessage>,
}

impl ChannelBroadcaster {
    pub fn new() -> (Self, UnboundedReceiver<NodeMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelBroadcaster { sender }, receiver)
    }

    fn send(&self, message: NodeMessage) {
        if self.sender.send(message).is_err() {
            warn!("Broadcast channel closed, dropping message");
        }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_chain(&self, chain: &[Block]) {
        self.send(NodeMessage::Blockchain(chain.to_vec()));
    }

    fn broadcast_transaction(&self, transaction: &Transaction) {
        self.send(NodeMessage::Transaction(transaction.clone()));
    }
}

/// Address and derived balance of the node's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub address: String,
    pub balance: u64,
}

/// A ledger node: chain, pool and wallet behind one handle
#[derive(Clone)]
pub struct Node {
    blockchain: Blockchain,
    pool: TransactionPool,
    wallet: Arc<Mutex<Wallet>>,
    config: Arc<Config>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Node {
    /// Creates a node with a fresh chain, an empty pool and a new wallet
    pub fn new(config: Arc<Config>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let wallet = Wallet::new(&config);
        Self::with_wallet(config, wallet, broadcaster)
    }

    pub fn with_wallet(config: Arc<Config>, wallet: Wallet, broadcaster: Arc<dyn Broadcaster>) -> Self {
        info!("Node wallet address: {}", wallet.public_key());
        Node {
            blockchain: Blockchain::new(config.clone()),
            pool: TransactionPool::new(config.clone()),
            wallet: Arc::new(Mutex::new(wallet)),
            config,
            broadcaster,
        }
    }

    fn wallet(&self) -> MutexGuard<'_, Wallet> {
        self.wallet.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    /// Snapshot of the chain
    pub fn chain(&self) -> Vec<Block> {
        self.blockchain.chain()
    }

    /// Snapshot of the pool
    pub fn pool_map(&self) -> HashMap<String, Transaction> {
        self.pool.transaction_map()
    }

    /// Address and balance of the node wallet on the current chain
    pub fn wallet_info(&self) -> WalletInfo {
        let address = self.wallet().public_key().to_string();
        let balance = Wallet::calculate_balance(&self.blockchain.chain(), &address, &self.config);
        WalletInfo { address, balance }
    }

    /// Sends `amount` from the node wallet to `recipient`
    ///
    /// Folds the transfer into the wallet's pending transaction when there is one,
    /// otherwise creates a new transaction against the current chain balance.
    ///
    /// # Arguments
    ///
    /// * `recipient` - The address receiving the funds
    /// * `amount` - The amount to transfer
    ///
    /// # Returns
    ///
    /// The pooled transaction
    pub fn submit_transaction(&self, recipient: &str, amount: u64) -> Result<Transaction, NodeError> {
        let mut wallet = self.wallet();

        let transaction = match self.pool.existing_transaction(wallet.public_key()) {
            Some(mut transaction) => {
                transaction.update(&wallet, recipient, amount)?;
                transaction
            }
            None => wallet.create_transaction(recipient, amount, Some(self.blockchain.chain().as_slice()))?,
        };

        self.pool.set_transaction(transaction.clone());
        drop(wallet);

        self.broadcaster.broadcast_transaction(&transaction);
        Ok(transaction)
    }

    /// Mines the valid part of the pool plus a reward for the node wallet
    pub async fn mine_transactions(&self) -> Result<Block, NodeError> {
        let chain = self.blockchain.chain();
        let mut transactions = self.pool.valid_transactions(&chain);
        transactions.push(Transaction::reward(&self.wallet(), &self.config));

        let block = self.mine(BlockData::Transactions(transactions)).await?;
        self.pool.clear();
        Ok(block)
    }

    /// Mines a block carrying an arbitrary payload
    pub async fn mine_data(&self, data: serde_json::Value) -> Result<Block, NodeError> {
        self.mine(BlockData::Arbitrary(data)).await
    }

    async fn mine(&self, data: BlockData) -> Result<Block, NodeError> {
        let blockchain = self.blockchain.clone();
        let block = tokio::task::spawn_blocking(move || blockchain.add_block(data)).await??;

        self.broadcaster.broadcast_chain(&self.blockchain.chain());
        Ok(block)
    }

    /// Abandons the block being mined, if any; queued jobs mine on the new tip
    pub fn cancel_mining(&self) {
        self.blockchain.cancel_mining();
    }

    /// Offers a peer's chain to the fork-choice rule
    pub fn receive_chain(&self, chain: Vec<Block>) -> ReplaceOutcome {
        self.blockchain.replace_chain_with(chain, true, |chain| {
            self.pool.clear_blockchain_transactions(chain);
            self.cancel_mining();
        })
    }

    /// Pools a transaction announced by a peer; it is validated when mined
    pub fn receive_transaction(&self, transaction: Transaction) {
        self.pool.set_transaction(transaction);
    }

    /// Replaces the pool with a peer's pool
    pub fn sync_pool(&self, transaction_map: HashMap<String, Transaction>) {
        self.pool.set_map(transaction_map);
    }

    /// Dispatches a message received from a peer
    pub fn handle_message(&self, message: NodeMessage) {
        match message {
            NodeMessage::Blockchain(chain) => {
                let outcome = self.receive_chain(chain);
                info!("Received chain from peer: {:?}", outcome);
            }
            NodeMessage::Transaction(transaction) => self.receive_transaction(transaction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (Node, UnboundedReceiver<NodeMessage>, Arc<Config>) {
        let config = Arc::new(Config::default());
        let (broadcaster, receiver) = ChannelBroadcaster::new();
        (Node::new(config.clone(), Arc::new(broadcaster)), receiver, config)
    }

    #[tokio::test]
    async fn test_submit_creates_then_updates() {
        let (node, mut receiver, _) = setup();

        let first = node.submit_transaction("foo", 50).unwrap();
        let second = node.submit_transaction("bar", 25).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(node.pool().len(), 1);
        assert_eq!(second.output_map["foo"], 50);
        assert_eq!(second.output_map["bar"], 25);
        assert!(second.is_valid());

        assert_eq!(receiver.recv().await, Some(NodeMessage::Transaction(first)));
        assert_eq!(receiver.recv().await, Some(NodeMessage::Transaction(second)));
    }

    #[tokio::test]
    async fn test_submit_rejects_overspend() {
        let (node, _receiver, _) = setup();

        let result = node.submit_transaction("foo", 999_999);

        assert!(matches!(
            result,
            Err(NodeError::Transaction(TransactionError::AmountExceedsBalance { .. }))
        ));
        assert!(node.pool().is_empty());
    }

    #[tokio::test]
    async fn test_mine_transactions() {
        let (node, mut receiver, config) = setup();
        let transaction = node.submit_transaction("foo", 50).unwrap();
        receiver.recv().await;

        let block = node.mine_transactions().await.unwrap();

        match &block.data {
            BlockData::Transactions(transactions) => {
                assert_eq!(transactions.len(), 2);
                assert_eq!(transactions[0], transaction);
                assert!(transactions[1].is_reward());
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(node.pool().is_empty());
        assert!(Blockchain::validate_transaction_data(&node.chain(), &config));
        assert_eq!(
            receiver.recv().await,
            Some(NodeMessage::Blockchain(node.chain()))
        );
        assert_eq!(node.wallet_info().balance, 950 + config.mining_reward);
    }

    #[tokio::test]
    async fn test_mine_data() {
        let (node, _receiver, _) = setup();
        let block = node.mine_data(serde_json::json!({"foo": "bar"})).await.unwrap();

        assert_eq!(node.chain().len(), 2);
        assert_eq!(node.blockchain().last_block(), block);
    }

    #[tokio::test]
    async fn test_receive_chain_from_peer() {
        let (node, _receiver, config) = setup();
        let (peer, _peer_receiver, _) = setup();

        let pooled = Wallet::new(&config).create_transaction("foo", 5, None).unwrap();
        peer.receive_transaction(pooled.clone());
        node.receive_transaction(pooled.clone());
        peer.mine_transactions().await.unwrap();

        assert_eq!(node.receive_chain(peer.chain()), ReplaceOutcome::Replaced);
        assert_eq!(node.chain(), peer.chain());
        assert!(node.pool_map().is_empty());

        assert_eq!(node.receive_chain(peer.chain()), ReplaceOutcome::NotLonger);
    }

    #[tokio::test]
    async fn test_handle_message() {
        let (node, _receiver, config) = setup();
        let transaction = Wallet::new(&config).create_transaction("foo", 5, None).unwrap();

        node.handle_message(NodeMessage::Transaction(transaction.clone()));

        assert_eq!(node.pool().get(&transaction.id), Some(transaction));
    }

    #[tokio::test]
    async fn test_sync_pool() {
        let (node, _receiver, config) = setup();
        let transaction = Wallet::new(&config).create_transaction("foo", 5, None).unwrap();
        let mut map = HashMap::new();
        map.insert(transaction.id.clone(), transaction);

        node.sync_pool(map.clone());

        assert_eq!(node.pool_map(), map);
    }

    #[tokio::test]
    async fn test_wallet_info_without_history() {
        let (node, _receiver, config) = setup();
        let info = node.wallet_info();

        assert_eq!(info.balance, config.starting_balance);
        assert_eq!(info.address.len(), 64);
    }

    fn unmineable_node() -> Node {
        let config = Arc::new(Config {
            initial_difficulty: 200,
            mine_rate_ms: i64::MAX,
            ..Config::default()
        });
        Node::new(config, Arc::new(NoopBroadcaster))
    }

    async fn wait_until_mining(node: &Node) {
        while !node.blockchain().is_mining() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mining() {
        let node = unmineable_node();

        let miner = node.clone();
        let job = tokio::spawn(async move { miner.mine_data(serde_json::json!("never")).await });
        wait_until_mining(&node).await;
        node.cancel_mining();

        let result = job.await.unwrap();
        assert!(matches!(
            result,
            Err(NodeError::Blockchain(BlockchainError::MiningCancelled))
        ));
        assert_eq!(node.chain().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mining_spares_queued_job() {
        let node = unmineable_node();

        let first = {
            let miner = node.clone();
            tokio::spawn(async move { miner.mine_data(serde_json::json!("first")).await })
        };
        wait_until_mining(&node).await;

        let second = {
            let miner = node.clone();
            tokio::spawn(async move { miner.mine_data(serde_json::json!("second")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        node.cancel_mining();
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(10), first).await.unwrap().unwrap(),
            Err(NodeError::Blockchain(BlockchainError::MiningCancelled))
        ));

        // The queued job takes over the producer lock and keeps mining.
        wait_until_mining(&node).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!second.is_finished());

        node.cancel_mining();
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(10), second).await.unwrap().unwrap(),
            Err(NodeError::Blockchain(BlockchainError::MiningCancelled))
        ));
        assert_eq!(node.chain().len(), 1);
    }

    #[test]
    fn test_message_serialization() {
        let config = Config::default();
        let message = NodeMessage::Blockchain(vec![Block::genesis(&config)]);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["channel"], "BLOCKCHAIN");
        let decoded: NodeMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }
}
