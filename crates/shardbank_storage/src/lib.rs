//! Storage layer: the shard store interface, an in-process shard store with
//! PostgreSQL-style prepared transactions, and the coordinator's intent log.

pub mod intent_log;
pub mod local_store;
pub mod shard_store;
pub mod wal;

pub use intent_log::{IntentEntry, IntentLog, IntentLogTxn, IntentRecord};
pub use local_store::LocalShardStore;
pub use shard_store::{QueryResult, Resolution, ShardStore, Statement};
pub use wal::SyncMode;
