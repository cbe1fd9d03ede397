//! Fixed, positional set of shard stores plus the router that places
//! accounts on them.
//!
//! Every primitive sent to a shard goes through this type so that the
//! statement stream can be traced in one place (target `shardbank::trace`,
//! level `debug`).

use std::collections::HashSet;
use std::sync::Arc;

use shardbank_common::config::ShardConfig;
use shardbank_common::error::{BankError, BankResult, StorageError};
use shardbank_common::types::{GlobalTxnId, ShardId};
use shardbank_storage::{LocalShardStore, QueryResult, Resolution, ShardStore, Statement};

use crate::sharding::ShardRouter;

const TRACE: &str = "shardbank::trace";

pub struct ShardedEngine {
    shards: Vec<Arc<dyn ShardStore>>,
    router: ShardRouter,
}

impl ShardedEngine {
    /// `shards[i]` must report `ShardId(i)`.
    pub fn new(shards: Vec<Arc<dyn ShardStore>>) -> BankResult<Self> {
        let router = ShardRouter::new(shards.len())?;
        for (i, store) in shards.iter().enumerate() {
            if store.shard_id() != ShardId(i as u64) {
                return Err(BankError::Config(format!(
                    "store at position {} reports {}",
                    i,
                    store.shard_id()
                )));
            }
        }
        Ok(Self { shards, router })
    }

    /// `n` volatile in-process shards.
    pub fn in_memory(n: usize) -> BankResult<Self> {
        Self::new(
            (0..n)
                .map(|i| Arc::new(LocalShardStore::in_memory(ShardId(i as u64))) as Arc<dyn ShardStore>)
                .collect(),
        )
    }

    /// Open one `LocalShardStore` per config entry.
    pub fn open(configs: &[ShardConfig]) -> BankResult<Self> {
        let mut shards: Vec<Arc<dyn ShardStore>> = Vec::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            let shard = ShardId(i as u64);
            let store = LocalShardStore::open(shard, config)
                .map_err(|source| BankError::Storage { shard, source })?;
            shards.push(Arc::new(store));
        }
        Self::new(shards)
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.router.all_shards()
    }

    pub fn shard_for(&self, account: &str) -> ShardId {
        self.router.shard_for(account)
    }

    pub fn stores(&self) -> &[Arc<dyn ShardStore>] {
        &self.shards
    }

    pub fn shard(&self, shard: ShardId) -> Option<&Arc<dyn ShardStore>> {
        self.shards.get(shard.index())
    }

    fn store(&self, shard: ShardId) -> Result<&Arc<dyn ShardStore>, StorageError> {
        self.shard(shard)
            .ok_or_else(|| StorageError::Unavailable(format!("{} is not configured", shard)))
    }

    pub fn execute(&self, shard: ShardId, stmt: &Statement) -> Result<QueryResult, StorageError> {
        let store = self.store(shard)?;
        tracing::debug!(target: TRACE, shard = shard.0, "{}", stmt);
        store.execute(stmt)
    }

    pub fn prepare(
        &self,
        shard: ShardId,
        gid: &GlobalTxnId,
        stmts: &[Statement],
    ) -> Result<(), StorageError> {
        let store = self.store(shard)?;
        tracing::debug!(target: TRACE, shard = shard.0, "BEGIN");
        for stmt in stmts {
            tracing::debug!(target: TRACE, shard = shard.0, "{}", stmt);
        }
        tracing::debug!(target: TRACE, shard = shard.0, "PREPARE TRANSACTION '{}'", gid);
        store.prepare_transaction(gid, stmts)
    }

    pub fn commit_prepared(&self, shard: ShardId, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        let store = self.store(shard)?;
        tracing::debug!(target: TRACE, shard = shard.0, "COMMIT PREPARED '{}'", gid);
        store.commit_prepared(gid)
    }

    pub fn rollback_prepared(&self, shard: ShardId, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        let store = self.store(shard)?;
        tracing::debug!(target: TRACE, shard = shard.0, "ROLLBACK PREPARED '{}'", gid);
        store.rollback_prepared(gid)
    }

    pub fn list_prepared(&self, shard: ShardId) -> Result<Vec<GlobalTxnId>, StorageError> {
        let store = self.store(shard)?;
        tracing::debug!(target: TRACE, shard = shard.0, "SELECT gid FROM pg_prepared_xacts");
        store.list_prepared()
    }

    pub fn forget_outcomes(&self, shard: ShardId, keep: &HashSet<GlobalTxnId>) -> Result<usize, StorageError> {
        let store = self.store(shard)?;
        let forgotten = store.forget_outcomes(keep)?;
        if forgotten > 0 {
            tracing::debug!(target: TRACE, shard = shard.0, forgotten, "forgot resolved outcomes");
        }
        Ok(forgotten)
    }
}
