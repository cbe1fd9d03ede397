//! Shared helpers for the integration tests.
#![allow(dead_code, unused_imports)]

use std::path::Path;
use std::sync::Arc;

use shardbank_cluster::{FaultInjector, ShardBank};
use shardbank_common::config::BankConfig;
use shardbank_common::types::ShardId;

/// In-memory config with millisecond backoff so exhaustion tests stay fast.
pub fn test_config(num_shards: usize) -> BankConfig {
    let mut config = BankConfig::in_memory(num_shards);
    shardbank_observability::init_tracing(&config.logging.filter);
    config.recovery.max_retries = 2;
    config.recovery.initial_backoff_ms = 1;
    config.recovery.max_backoff_ms = 4;
    for shard in &mut config.shards {
        shard.lock_wait_timeout_ms = 200;
    }
    config
}

/// Durable config rooted at `dir`, unsynced for speed.
pub fn durable_config(dir: &Path, num_shards: usize) -> BankConfig {
    let mut config = BankConfig::durable(dir, num_shards);
    shardbank_observability::init_tracing(&config.logging.filter);
    config.coordinator.sync_mode = "none".into();
    for shard in &mut config.shards {
        shard.sync_mode = "none".into();
        shard.lock_wait_timeout_ms = 200;
    }
    config.recovery.max_retries = 2;
    config.recovery.initial_backoff_ms = 1;
    config.recovery.max_backoff_ms = 4;
    config
}

pub fn open_bank(num_shards: usize) -> ShardBank {
    ShardBank::open(test_config(num_shards)).unwrap()
}

pub fn open_faulty(config: BankConfig) -> (ShardBank, Arc<FaultInjector>) {
    let faults = Arc::new(FaultInjector::new());
    let bank = ShardBank::open_with_faults(config, Arc::clone(&faults)).unwrap();
    (bank, faults)
}

/// An account name that routes to `shard`: `prefix` itself if it does,
/// otherwise the first `prefix-<i>` that does.
pub fn name_on_shard(bank: &ShardBank, shard: u64, prefix: &str) -> String {
    if bank.shard_for(prefix) == ShardId(shard) {
        return prefix.to_string();
    }
    (0..10_000)
        .map(|i| format!("{}-{}", prefix, i))
        .find(|name| bank.shard_for(name) == ShardId(shard))
        .unwrap()
}

/// Prepared transactions currently open on `shard`.
pub fn prepared_on(bank: &ShardBank, shard: u64) -> usize {
    bank.engine().list_prepared(ShardId(shard)).unwrap().len()
}

pub fn prepared_total(bank: &ShardBank) -> usize {
    (0..bank.num_shards() as u64).map(|s| prepared_on(bank, s)).sum()
}
