//! Account placement: account name → shard.
//!
//! Accounts are assigned by hashing the UTF-8 bytes of the name with
//! xxHash3-64 and taking the result modulo the shard count. The hash is
//! seedless, so placement is identical across calls, threads and process
//! restarts.

use shardbank_common::error::{BankError, BankResult};
use shardbank_common::types::ShardId;
use xxhash_rust::xxh3::xxh3_64;

/// Hash used for shard assignment.
pub fn shard_hash(account: &str) -> u64 {
    xxh3_64(account.as_bytes())
}

/// Pure, stateless router over a fixed number of shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    num_shards: u64,
}

impl ShardRouter {
    pub fn new(num_shards: usize) -> BankResult<Self> {
        if num_shards == 0 {
            return Err(BankError::Config("shard router needs at least one shard".into()));
        }
        Ok(Self { num_shards: num_shards as u64 })
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards as usize
    }

    /// Shard owning `account`.
    pub fn shard_for(&self, account: &str) -> ShardId {
        ShardId(shard_hash(account) % self.num_shards)
    }

    pub fn all_shards(&self) -> Vec<ShardId> {
        (0..self.num_shards).map(ShardId).collect()
    }
}
