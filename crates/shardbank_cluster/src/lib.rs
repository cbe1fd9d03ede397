//! Cross-shard transfer coordination for a sharded ledger: account routing,
//! two-phase commit anchored on a durable intent log, and crash recovery.

pub mod bank;
pub mod fault_injection;
pub mod recovery;
pub mod sharded_engine;
pub mod sharding;
pub mod two_phase;

pub use bank::ShardBank;
pub use fault_injection::{CrashPoint, FaultInjector, FaultyShardStore, ShardOp};
pub use recovery::{RecoveryMetrics, RecoveryReport, RecoverySweeper, RetryConfig, SweeperHandle};
pub use sharded_engine::ShardedEngine;
pub use sharding::ShardRouter;
pub use two_phase::{Branch, TransferReceipt, TwoPhaseCoordinator};
