use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::env;
use std::path::Path;
use std::str::FromStr;

const INITIAL_DIFFICULTY_KEY: &str = "CRYPTOCHAIN_INITIAL_DIFFICULTY";
const MINE_RATE_KEY: &str = "CRYPTOCHAIN_MINE_RATE_MS";
const STARTING_BALANCE_KEY: &str = "CRYPTOCHAIN_STARTING_BALANCE";
const MINING_REWARD_KEY: &str = "CRYPTOCHAIN_MINING_REWARD";
const REWARD_ADDRESS_KEY: &str = "CRYPTOCHAIN_REWARD_ADDRESS";

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunable constants shared by the chain, wallets and transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Difficulty of the genesis block
    pub initial_difficulty: u32,

    /// Target time between blocks in milliseconds
    pub mine_rate_ms: i64,

    /// Balance every address starts with before any history
    pub starting_balance: u64,

    /// Amount credited by a reward transaction
    pub mining_reward: u64,

    /// Sentinel input address that marks a reward transaction
    pub reward_input_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_difficulty: 3,
            mine_rate_ms: 1000,
            starting_balance: 1000,
            mining_reward: 50,
            reward_input_address: "*authorized-reward*".to_string(),
        }
    }
}

impl Config {
    /// Builds a config from the defaults, overridden by `CRYPTOCHAIN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(value) = env_value(INITIAL_DIFFICULTY_KEY)? {
            config.initial_difficulty = value;
        }
        if let Some(value) = env_value(MINE_RATE_KEY)? {
            config.mine_rate_ms = value;
        }
        if let Some(value) = env_value(STARTING_BALANCE_KEY)? {
            config.starting_balance = value;
        }
        if let Some(value) = env_value(MINING_REWARD_KEY)? {
            config.mining_reward = value;
        }
        if let Ok(address) = env::var(REWARD_ADDRESS_KEY) {
            config.reward_input_address = address;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON config file; missing fields keep their defaults
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the JSON document
    ///
    /// # Returns
    ///
    /// The parsed Config
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_difficulty == 0 {
            return Err(ConfigError::InvalidValue {
                key: INITIAL_DIFFICULTY_KEY,
                value: self.initial_difficulty.to_string(),
            });
        }
        if self.mine_rate_ms < 0 {
            return Err(ConfigError::InvalidValue {
                key: MINE_RATE_KEY,
                value: self.mine_rate_ms.to_string(),
            });
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, PoisonError};

    // The environment is process-wide, so tests touching it take turns.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 5] = [
        INITIAL_DIFFICULTY_KEY,
        MINE_RATE_KEY,
        STARTING_BALANCE_KEY,
        MINING_REWARD_KEY,
        REWARD_ADDRESS_KEY,
    ];

    fn from_env_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for key in KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }

        let result = Config::from_env();

        for key in KEYS {
            env::remove_var(key);
        }
        result
    }

    #[test]
    fn test_env_without_overrides() {
        assert_eq!(from_env_with(&[]).unwrap(), Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let config = from_env_with(&[
            (INITIAL_DIFFICULTY_KEY, "5"),
            (MINE_RATE_KEY, " 250 "),
            (STARTING_BALANCE_KEY, "42"),
            (MINING_REWARD_KEY, "7"),
            (REWARD_ADDRESS_KEY, "*miner*"),
        ])
        .unwrap();

        assert_eq!(
            config,
            Config {
                initial_difficulty: 5,
                mine_rate_ms: 250,
                starting_balance: 42,
                mining_reward: 7,
                reward_input_address: "*miner*".to_string(),
            }
        );
    }

    #[test]
    fn test_env_unparsable_value() {
        match from_env_with(&[(STARTING_BALANCE_KEY, "lots")]) {
            Err(ConfigError::InvalidValue { key, value }) => {
                assert_eq!(key, STARTING_BALANCE_KEY);
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            from_env_with(&[(MINING_REWARD_KEY, "-1")]),
            Err(ConfigError::InvalidValue { key: MINING_REWARD_KEY, .. })
        ));
    }

    #[test]
    fn test_env_rejects_zero_difficulty() {
        assert!(matches!(
            from_env_with(&[(INITIAL_DIFFICULTY_KEY, "0")]),
            Err(ConfigError::InvalidValue { key: INITIAL_DIFFICULTY_KEY, .. })
        ));
    }

    #[test]
    fn test_env_rejects_negative_mine_rate() {
        assert!(matches!(
            from_env_with(&[(MINE_RATE_KEY, "-10")]),
            Err(ConfigError::InvalidValue { key: MINE_RATE_KEY, .. })
        ));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.initial_difficulty, 3);
        assert_eq!(config.mine_rate_ms, 1000);
        assert_eq!(config.starting_balance, 1000);
        assert_eq!(config.mining_reward, 50);
        assert_eq!(config.reward_input_address, "*authorized-reward*");
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"miningReward": 25, "mineRateMs": 500}}"#).unwrap();

        let config = Config::from_json_file(file.path()).unwrap();

        assert_eq!(config.mining_reward, 25);
        assert_eq!(config.mine_rate_ms, 500);
        assert_eq!(config.starting_balance, 1000);
    }

    #[test]
    fn test_json_file_rejects_zero_difficulty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"initialDifficulty": 0}}"#).unwrap();

        let result = Config::from_json_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_json_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let result = Config::from_json_file(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_json_file("/nonexistent/cryptochain.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
