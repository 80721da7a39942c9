use anyhow::{Context, Result};
use log::info;

use std::sync::Arc;

use cryptochain::blockchain::{Config, Wallet};
use cryptochain::node::{Node, NoopBroadcaster};

const CONFIG_PATH_KEY: &str = "CRYPTOCHAIN_CONFIG";
const ROUNDS_KEY: &str = "CRYPTOCHAIN_ROUNDS";
const DEFAULT_ROUNDS: usize = 10;

fn load_config() -> Result<Config> {
    match std::env::var(CONFIG_PATH_KEY) {
        Ok(path) => Config::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {}", path)),
        Err(_) => Config::from_env().context("Failed to read config from environment"),
    }
}

fn rounds() -> Result<usize> {
    match std::env::var(ROUNDS_KEY) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {}: {}", ROUNDS_KEY, value)),
        Err(_) => Ok(DEFAULT_ROUNDS),
    }
}

// Pools a transfer from `wallet`, using its balance on the node's current chain
fn wallet_transfer(node: &Node, wallet: &mut Wallet, recipient: &str, amount: u64) -> Result<()> {
    let transaction = wallet.create_transaction(recipient, amount, Some(node.chain().as_slice()))?;
    node.receive_transaction(transaction);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Arc::new(load_config()?);
    info!("Starting with {:?}", config);

    let node = Node::new(config.clone(), Arc::new(NoopBroadcaster));
    let mut foo = Wallet::new(&config);
    let mut bar = Wallet::new(&config);
    let node_address = node.wallet_info().address;

    let mut times = Vec::new();
    for round in 0..rounds()? {
        match round % 3 {
            0 => {
                node.submit_transaction(foo.public_key(), 5)?;
                let recipient = bar.public_key().to_string();
                wallet_transfer(&node, &mut foo, &recipient, 10)?;
            }
            1 => {
                node.submit_transaction(foo.public_key(), 5)?;
                wallet_transfer(&node, &mut bar, &node_address, 15)?;
            }
            _ => {
                let recipient = bar.public_key().to_string();
                wallet_transfer(&node, &mut foo, &recipient, 10)?;
                wallet_transfer(&node, &mut bar, &node_address, 15)?;
            }
        }

        let previous = node.blockchain().last_block();
        let block = node.mine_transactions().await?;
        let elapsed = block.timestamp - previous.timestamp;
        times.push(elapsed);
        let average = times.iter().sum::<i64>() as f64 / times.len() as f64;

        info!(
            "Time to mine block: {}ms. Difficulty: {}. Average time: {:.1}ms",
            elapsed, block.difficulty, average
        );
    }

    let info = node.wallet_info();
    info!(
        "Chain length {}, node wallet {} holds {}",
        node.chain().len(),
        info.address,
        info.balance
    );

    Ok(())
}
