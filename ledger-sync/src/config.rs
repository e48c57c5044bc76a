//! Configuration for the synchronization engine

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Chain connectivity
    pub chain: ChainConfig,

    /// Replay and live subscription
    pub sync: SyncConfig,

    /// Mint/burn submission
    pub submission: SubmissionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger-sync"),
            service_name: "ledger-sync".to_string(),
            rocksdb: RocksDBConfig::default(),
            chain: ChainConfig::default(),
            sync: SyncConfig::default(),
            submission: SubmissionConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Chain connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// WebSocket JSON-RPC endpoint
    pub rpc_url: String,

    /// Token contract; without it the pipeline stays dormant
    pub contract_address: Option<Address>,

    /// Hex private key used to sign mint/burn calls
    pub signer_key: Option<String>,

    /// First block replayed on a fresh start
    pub start_block: u64,

    /// Max blocks per getLogs request
    pub max_block_range: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "ws://127.0.0.1:8545".to_string(),
            contract_address: None,
            signer_key: None,
            start_block: 0,
            max_block_range: 5_000,
        }
    }
}

/// Replay and live subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay before resubscribing after a failure (seconds)
    pub reconnect_delay_secs: u64,

    /// Health log interval while listening (seconds)
    pub health_interval_secs: u64,

    /// Asset credited/debited by plain Transfer events, if any
    pub transfer_asset_id: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 30,
            health_interval_secs: 300,
            transfer_asset_id: None,
        }
    }
}

impl SyncConfig {
    /// Reconnect delay
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Health tick interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Mint/burn submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Receipt poll interval (milliseconds)
    pub receipt_poll_interval_ms: u64,

    /// Receipt polls before giving up
    pub receipt_max_attempts: u32,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            receipt_poll_interval_ms: 2_000,
            receipt_max_attempts: 30,
        }
    }
}

impl SubmissionConfig {
    /// Receipt poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `LEDGER_SYNC_*` variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LEDGER_SYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(url) = std::env::var("LEDGER_SYNC_RPC_URL") {
            self.chain.rpc_url = url;
        }

        if let Ok(addr) = std::env::var("LEDGER_SYNC_CONTRACT_ADDRESS") {
            let parsed = addr
                .parse::<Address>()
                .map_err(|e| crate::Error::Config(format!("Invalid contract address: {}", e)))?;
            self.chain.contract_address = Some(parsed);
        }

        if let Ok(key) = std::env::var("LEDGER_SYNC_SIGNER_KEY") {
            self.chain.signer_key = Some(key);
        }

        if let Ok(block) = std::env::var("LEDGER_SYNC_START_BLOCK") {
            self.chain.start_block = parse_env("LEDGER_SYNC_START_BLOCK", &block)?;
        }

        if let Ok(delay) = std::env::var("LEDGER_SYNC_RECONNECT_DELAY_SECS") {
            self.sync.reconnect_delay_secs = parse_env("LEDGER_SYNC_RECONNECT_DELAY_SECS", &delay)?;
        }

        if let Ok(asset) = std::env::var("LEDGER_SYNC_TRANSFER_ASSET_ID") {
            self.sync.transfer_asset_id = Some(asset);
        }

        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.chain.max_block_range == 0 {
            return Err(crate::Error::Config(
                "chain.max_block_range must be positive".to_string(),
            ));
        }
        if self.submission.receipt_max_attempts == 0 {
            return Err(crate::Error::Config(
                "submission.receipt_max_attempts must be positive".to_string(),
            ));
        }
        if self.sync.health_interval_secs == 0 {
            return Err(crate::Error::Config(
                "sync.health_interval_secs must be positive".to_string(),
            ));
        }
        if matches!(&self.sync.transfer_asset_id, Some(id) if id.trim().is_empty()) {
            return Err(crate::Error::Config(
                "sync.transfer_asset_id must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}
