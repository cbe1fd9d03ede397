use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BankError, BankResult};

/// Top-level configuration: coordinator store, shard stores, recovery and
/// transfer policy. Passed explicitly into constructors; nothing is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// One entry per shard, indexed positionally (`shards[0]` is shard 0).
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub transfer: TransferPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator store settings (hosts the intent log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Directory for the intent log file. Empty = in-memory only.
    #[serde(default)]
    pub data_dir: String,
    /// Namespace prepended to every global transaction id.
    #[serde(default = "default_txn_id_prefix")]
    pub txn_id_prefix: String,
    /// Sync mode: "fsync", "fdatasync", or "none".
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,
}

fn default_txn_id_prefix() -> String {
    "shardbank".to_string()
}

fn default_sync_mode() -> String {
    "fsync".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            txn_id_prefix: default_txn_id_prefix(),
            sync_mode: default_sync_mode(),
        }
    }
}

/// Per-shard store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Directory for this shard's write-ahead file. Empty = in-memory only.
    #[serde(default)]
    pub data_dir: String,
    /// How long a statement waits for a row held by a prepared transaction.
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,
    /// When false, a branch that would drive a balance below zero fails to prepare.
    #[serde(default)]
    pub allow_negative_balance: bool,
    /// Sync mode: "fsync", "fdatasync", or "none".
    #[serde(default = "default_sync_mode")]
    pub sync_mode: String,
    /// Resolved transaction outcomes kept before the store forgets the ones
    /// the coordinator no longer references.
    #[serde(default = "default_outcome_retention")]
    pub outcome_retention: usize,
}

fn default_lock_wait_timeout_ms() -> u64 {
    5_000
}

fn default_outcome_retention() -> usize {
    10_000
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
            allow_negative_balance: false,
            sync_mode: default_sync_mode(),
            outcome_retention: default_outcome_retention(),
        }
    }
}

impl ShardConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

/// Recovery sweeper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Retries per commit/rollback/list call before the shard is halted.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Run one reconciliation pass when the bank is opened.
    #[serde(default = "default_true")]
    pub reconcile_on_open: bool,
    /// Run reconciliation periodically on a background thread.
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            reconcile_on_open: true,
            background: false,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Input validation applied before any shard is touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    pub require_positive_amount: bool,
    pub reject_self_transfer: bool,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            require_positive_amount: true,
            reject_self_transfer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Prometheus listen address. Empty = exporter disabled.
    #[serde(default)]
    pub metrics_listen_addr: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,shardbank=debug".to_string(),
            metrics_listen_addr: String::new(),
        }
    }
}

impl Default for BankConfig {
    fn default() -> Self {
        Self::in_memory(2)
    }
}

impl BankConfig {
    /// `num_shards` in-memory shards and an in-memory coordinator store.
    pub fn in_memory(num_shards: usize) -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            shards: vec![ShardConfig::default(); num_shards],
            recovery: RecoveryConfig::default(),
            transfer: TransferPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Durable layout under `root`: `root/coordinator` and `root/shard_<i>`.
    pub fn durable(root: &Path, num_shards: usize) -> Self {
        let mut config = Self::in_memory(num_shards);
        config.coordinator.data_dir = root.join("coordinator").to_string_lossy().into_owned();
        for (i, shard) in config.shards.iter_mut().enumerate() {
            shard.data_dir = root.join(format!("shard_{}", i)).to_string_lossy().into_owned();
        }
        config
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn from_toml_str(content: &str) -> BankResult<Self> {
        let config: BankConfig =
            toml::from_str(content).map_err(|e| BankError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Strict load: a missing or malformed file is an error.
    pub fn load(path: &Path) -> BankResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BankError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Lenient load: falls back to defaults and logs why.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match Self::from_toml_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config {}: {}, using defaults", path.display(), e);
                    BankConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                BankConfig::default()
            }
        }
    }

    pub fn validate(&self) -> BankResult<()> {
        if self.shards.is_empty() {
            return Err(BankError::Config("at least one shard is required".into()));
        }
        if self.coordinator.txn_id_prefix.is_empty() {
            return Err(BankError::Config("coordinator.txn_id_prefix must not be empty".into()));
        }
        if self.recovery.backoff_multiplier < 1.0 {
            return Err(BankError::Config(format!(
                "recovery.backoff_multiplier must be >= 1.0, got {}",
                self.recovery.backoff_multiplier
            )));
        }
        let durable_shards = self.shards.iter().filter(|s| !s.data_dir.is_empty()).count();
        if durable_shards > 0 && self.coordinator.data_dir.is_empty() {
            tracing::warn!(
                "{} durable shard(s) but an in-memory coordinator: decisions will not survive a restart",
                durable_shards
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = BankConfig::from_toml_str(
            r#"
            [[shards]]
            [[shards]]
            "#,
        )
        .unwrap();
        assert_eq!(config.num_shards(), 2);
        assert_eq!(config.coordinator.txn_id_prefix, "shardbank");
        assert_eq!(config.recovery.max_retries, 3);
        assert!(config.recovery.reconcile_on_open);
        assert!(config.transfer.reject_self_transfer);
        assert!(!config.shards[0].allow_negative_balance);
        assert_eq!(config.shards[1].lock_wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_full_toml() {
        let config = BankConfig::from_toml_str(
            r#"
            [coordinator]
            data_dir = "/var/lib/shardbank/coord"
            txn_id_prefix = "piggybank"
            sync_mode = "none"

            [[shards]]
            data_dir = "/var/lib/shardbank/s0"
            lock_wait_timeout_ms = 250

            [[shards]]
            data_dir = "/var/lib/shardbank/s1"
            allow_negative_balance = true
            outcome_retention = 64

            [recovery]
            max_retries = 7
            initial_backoff_ms = 1
            max_backoff_ms = 50
            backoff_multiplier = 3.0
            background = true
            sweep_interval_ms = 100

            [transfer]
            require_positive_amount = true
            reject_self_transfer = false

            [logging]
            filter = "warn"
            metrics_listen_addr = "127.0.0.1:9100"
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator.txn_id_prefix, "piggybank");
        assert_eq!(config.shards[0].lock_wait_timeout_ms, 250);
        assert!(config.shards[1].allow_negative_balance);
        assert_eq!(config.shards[0].outcome_retention, 10_000);
        assert_eq!(config.shards[1].outcome_retention, 64);
        assert_eq!(config.recovery.max_retries, 7);
        assert!(config.recovery.background);
        assert!(!config.transfer.reject_self_transfer);
        assert_eq!(config.logging.metrics_listen_addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_empty_shard_list_rejected() {
        let err = BankConfig::from_toml_str("shards = []").unwrap_err();
        assert!(matches!(err, BankError::Config(_)));
    }

    #[test]
    fn test_bad_multiplier_rejected() {
        let mut config = BankConfig::in_memory(1);
        config.recovery.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(BankConfig::load(&path).is_err());
        let fallback = BankConfig::load_or_default(&path);
        assert_eq!(fallback.num_shards(), 2);
    }

    #[test]
    fn test_durable_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = BankConfig::durable(dir.path(), 3);
        assert_eq!(config.num_shards(), 3);
        assert!(config.coordinator.data_dir.ends_with("coordinator"));
        assert!(config.shards[2].data_dir.ends_with("shard_2"));
    }
}
