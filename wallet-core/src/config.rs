//! Configuration for the wallet ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Row-lock wait budget (milliseconds) before a mutation aborts
    /// with `LockTimeout`
    pub lock_wait_ms: u64,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet"),
            service_name: "wallet-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            lock_wait_ms: 10_000, // 10s, inside the 5-30s band
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(wait) = std::env::var("WALLET_LOCK_WAIT_MS") {
            config.lock_wait_ms = wait
                .parse()
                .map_err(|e| crate::Error::Config(format!("WALLET_LOCK_WAIT_MS: {}", e)))?;
        }

        Ok(config)
    }

    /// Lock wait budget as a `Duration`
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}
