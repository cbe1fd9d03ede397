//! Two-Phase Commit (2PC) coordinator for cross-shard transfers.
//!
//! Ensures atomicity across shards: either both branches of a transfer
//! commit or both roll back, across coordinator and shard crashes.
//!
//! Protocol (every step holds the intent log lock):
//! 1. **Begin**: lock the intent log and allocate a global transaction id.
//! 2. **Prepare destination**: credit + `PREPARE TRANSACTION`, then append
//!    `(id, dest_shard)` to the open coordinator transaction.
//! 3. **Prepare source**: debit + `PREPARE TRANSACTION`, append
//!    `(id, source_shard)`.
//! 4. **Decide**: commit the coordinator transaction. Both entries become
//!    durable in one write; this is the commit point.
//! 5. **Finalize**: run the recovery sweeper, which commits the logged
//!    branches, then release the lock.
//!
//! Any failure before step 4 completes discards the staged intents and runs
//! the sweeper, which rolls back the prepared but unlogged branches. The
//! original error is then returned.
//!
//! A simulated coordinator crash returns at once: staged intents are lost
//! with the lock and no sweep runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use shardbank_common::config::TransferPolicy;
use shardbank_common::error::{BankError, BankResult};
use shardbank_common::types::{Amount, GlobalTxnId, ShardId};
use shardbank_storage::{IntentEntry, IntentLog, IntentLogTxn, Statement};

use crate::fault_injection::{CrashPoint, FaultInjector};
use crate::recovery::RecoverySweeper;
use crate::sharded_engine::ShardedEngine;

/// One shard's part of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub shard_id: ShardId,
    pub statements: Vec<Statement>,
}

/// Result of a committed transfer.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub txn_id: GlobalTxnId,
    /// Logged branches, destination first.
    pub branches: Vec<IntentEntry>,
    pub prepare_latency_us: u64,
    pub decide_latency_us: u64,
    /// False when the decision is durable but the post-commit sweep failed;
    /// a later sweep completes the transfer.
    pub finalized: bool,
}

/// Coordinates 2PC transfers across the shards of one `ShardedEngine`.
pub struct TwoPhaseCoordinator {
    engine: Arc<ShardedEngine>,
    intent_log: Arc<IntentLog>,
    sweeper: Arc<RecoverySweeper>,
    policy: TransferPolicy,
    faults: Arc<FaultInjector>,
    total_attempted: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl TwoPhaseCoordinator {
    pub fn new(
        engine: Arc<ShardedEngine>,
        intent_log: Arc<IntentLog>,
        sweeper: Arc<RecoverySweeper>,
        policy: TransferPolicy,
        faults: Arc<FaultInjector>,
    ) -> Self {
        Self {
            engine,
            intent_log,
            sweeper,
            policy,
            faults,
            total_attempted: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    /// Move `amount` from `source` to `dest` atomically.
    pub fn transfer(&self, source: &str, dest: &str, amount: Amount) -> BankResult<TransferReceipt> {
        if let Err(e) = self.validate(source, dest, amount) {
            shardbank_observability::record_transfer("rejected");
            return Err(e);
        }
        self.total_attempted.fetch_add(1, Ordering::Relaxed);
        let branches = self.plan(source, dest, amount)?;

        let prepare_start = Instant::now();
        let mut txn = self.intent_log.begin();
        let txn_id = txn.next_txn_id();
        tracing::debug!(%txn_id, source, dest, amount, branches = branches.len(), "transfer started");

        if let Err(e) = self.prepare_and_log(&mut txn, &txn_id, &branches) {
            if matches!(e, BankError::InjectedCrash(_)) {
                shardbank_observability::record_transfer("crashed");
                return Err(e);
            }
            return Err(self.abort(&mut txn, &txn_id, e));
        }

        if self.faults.take_crash(CrashPoint::BeforeIntentCommit) {
            shardbank_observability::record_transfer("crashed");
            return Err(BankError::InjectedCrash(CrashPoint::BeforeIntentCommit.as_str()));
        }

        let logged: Vec<IntentEntry> = txn.pending().to_vec();
        if self.faults.take_intent_commit_failure() {
            self.intent_log.fail_next_write();
        }
        match txn.checkpoint() {
            Ok(entries) => shardbank_observability::record_intent_log_size(entries),
            Err(source) => {
                let e = BankError::LogWriteFailure {
                    context: format!("commit intents of {}", txn_id),
                    source,
                };
                return Err(self.abort(&mut txn, &txn_id, e));
            }
        }
        let prepare_latency_us = prepare_start.elapsed().as_micros() as u64;

        if self.faults.take_crash(CrashPoint::AfterIntentCommit) {
            shardbank_observability::record_transfer("crashed");
            return Err(BankError::InjectedCrash(CrashPoint::AfterIntentCommit.as_str()));
        }

        // Finalize before releasing the lock: the next transfer may touch
        // rows our prepared branches still hold.
        let decide_start = Instant::now();
        let finalized = match self.sweeper.reconcile_locked(&mut txn) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    %txn_id,
                    error = %e,
                    "transfer decided but not yet finalized, a later sweep will complete it"
                );
                false
            }
        };
        drop(txn);
        let decide_latency_us = decide_start.elapsed().as_micros() as u64;

        self.total_committed.fetch_add(1, Ordering::Relaxed);
        shardbank_observability::record_transfer("committed");
        shardbank_observability::record_transfer_latency(prepare_latency_us, decide_latency_us);
        tracing::info!(%txn_id, source, dest, amount, finalized, "transfer committed");

        Ok(TransferReceipt {
            txn_id,
            branches: logged,
            prepare_latency_us,
            decide_latency_us,
            finalized,
        })
    }

    fn validate(&self, source: &str, dest: &str, amount: Amount) -> BankResult<()> {
        if self.policy.require_positive_amount && amount <= 0 {
            return Err(BankError::InvalidTransfer(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if amount.checked_neg().is_none() {
            return Err(BankError::InvalidTransfer(format!(
                "amount {} cannot be debited",
                amount
            )));
        }
        if self.policy.reject_self_transfer && source == dest {
            return Err(BankError::InvalidTransfer(format!(
                "source and destination are both '{}'",
                source
            )));
        }
        Ok(())
    }

    /// Destination branch first. Both sides on one shard merge into a
    /// single branch so each `(id, shard)` is prepared and logged once.
    pub fn plan(&self, source: &str, dest: &str, amount: Amount) -> BankResult<Vec<Branch>> {
        let dest_shard = self.engine.shard_for(dest);
        let source_shard = self.engine.shard_for(source);
        let credit = Statement::credit(dest, amount);
        let debit = Statement::debit(source, amount)
            .map_err(|e| BankError::InvalidTransfer(e.to_string()))?;
        Ok(if dest_shard == source_shard {
            vec![Branch { shard_id: dest_shard, statements: vec![credit, debit] }]
        } else {
            vec![
                Branch { shard_id: dest_shard, statements: vec![credit] },
                Branch { shard_id: source_shard, statements: vec![debit] },
            ]
        })
    }

    fn prepare_and_log(
        &self,
        txn: &mut IntentLogTxn<'_>,
        txn_id: &GlobalTxnId,
        branches: &[Branch],
    ) -> BankResult<()> {
        for (i, branch) in branches.iter().enumerate() {
            let shard = branch.shard_id;
            self.engine
                .prepare(shard, txn_id, &branch.statements)
                .map_err(|source| BankError::PrepareFailure {
                    txn_id: txn_id.clone(),
                    shard,
                    source,
                })?;
            txn.append(IntentEntry::new(txn_id.clone(), shard))
                .map_err(|source| BankError::LogWriteFailure {
                    context: format!("append ({}, {})", txn_id, shard),
                    source,
                })?;
            if i == 0 && self.faults.take_crash(CrashPoint::AfterDestinationPrepare) {
                return Err(BankError::InjectedCrash(CrashPoint::AfterDestinationPrepare.as_str()));
            }
        }
        Ok(())
    }

    /// Abort path: drop the staged intents and sweep in the same critical
    /// section so prepared branches are rolled back, then hand back the cause.
    fn abort(&self, txn: &mut IntentLogTxn<'_>, txn_id: &GlobalTxnId, cause: BankError) -> BankError {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
        shardbank_observability::record_transfer("aborted");
        tracing::warn!(%txn_id, error = %cause, "transfer aborted");
        txn.discard();
        if let Err(e) = self.sweeper.reconcile_locked(txn) {
            tracing::warn!(%txn_id, error = %e, "cleanup sweep after abort reported an error");
        }
        cause
    }

    pub fn total_attempted(&self) -> u64 {
        self.total_attempted.load(Ordering::Relaxed)
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardbank_common::config::RecoveryConfig;
    use shardbank_common::error::StorageError;

    fn coordinator(n: usize, policy: TransferPolicy) -> (Arc<ShardedEngine>, Arc<IntentLog>, TwoPhaseCoordinator) {
        let engine = Arc::new(ShardedEngine::in_memory(n).unwrap());
        let log = Arc::new(IntentLog::in_memory("t"));
        let sweeper = RecoverySweeper::new(Arc::clone(&engine), Arc::clone(&log), &RecoveryConfig::default());
        let coord = TwoPhaseCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&log),
            sweeper,
            policy,
            Arc::new(FaultInjector::new()),
        );
        (engine, log, coord)
    }

    fn open_account(engine: &ShardedEngine, name: &str, balance: Amount) {
        engine
            .execute(engine.shard_for(name), &Statement::InsertAccount { name: name.into(), balance })
            .unwrap();
    }

    fn balance(engine: &ShardedEngine, name: &str) -> Amount {
        engine
            .execute(engine.shard_for(name), &Statement::SelectBalance { name: name.into() })
            .unwrap()
            .scalar()
            .unwrap()
    }

    #[test]
    fn test_policy_rejects_before_touching_shards() {
        let (_, log, coord) = coordinator(2, TransferPolicy::default());
        assert!(matches!(coord.transfer("a", "b", 0), Err(BankError::InvalidTransfer(_))));
        assert!(matches!(coord.transfer("a", "b", -5), Err(BankError::InvalidTransfer(_))));
        assert!(matches!(coord.transfer("a", "a", 5), Err(BankError::InvalidTransfer(_))));
        assert_eq!(coord.total_attempted(), 0);
        assert_eq!(log.commits(), 0);
    }

    #[test]
    fn test_plan_merges_same_shard() {
        let (engine, _, coord) = coordinator(1, TransferPolicy::default());
        let plan = coord.plan("alice", "bob", 10).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].shard_id, engine.shard_for("alice"));
        assert_eq!(
            plan[0].statements,
            vec![Statement::credit("bob", 10), Statement::debit("alice", 10).unwrap()]
        );
    }

    #[test]
    fn test_min_amount_rejected_without_positivity_check() {
        let policy = TransferPolicy { require_positive_amount: false, reject_self_transfer: true };
        let (engine, log, coord) = coordinator(2, policy);
        open_account(&engine, "alice", 100);
        open_account(&engine, "bob", 50);
        let err = coord.transfer("alice", "bob", Amount::MIN).unwrap_err();
        assert!(matches!(err, BankError::InvalidTransfer(_)));
        assert!(coord.plan("alice", "bob", Amount::MIN).is_err());
        assert_eq!(coord.total_attempted(), 0);
        assert_eq!(log.commits(), 0);

        // Other negative amounts move funds the other way.
        coord.transfer("alice", "bob", -10).unwrap();
        assert_eq!(balance(&engine, "alice"), 110);
        assert_eq!(balance(&engine, "bob"), 40);
    }

    #[test]
    fn test_transfer_commits_and_clears_log() {
        let (engine, log, coord) = coordinator(2, TransferPolicy::default());
        open_account(&engine, "alice", 100);
        open_account(&engine, "bob", 50);
        let receipt = coord.transfer("alice", "bob", 30).unwrap();
        assert!(receipt.finalized);
        assert_eq!(receipt.branches[0].shard_id, engine.shard_for("bob"));
        assert_eq!(balance(&engine, "alice"), 70);
        assert_eq!(balance(&engine, "bob"), 80);
        assert!(log.is_empty());
        assert_eq!(coord.total_committed(), 1);
    }

    #[test]
    fn test_failed_prepare_aborts_everything() {
        let (engine, log, coord) = coordinator(2, TransferPolicy::default());
        open_account(&engine, "alice", 10);
        open_account(&engine, "bob", 50);
        let err = coord.transfer("alice", "bob", 30).unwrap_err();
        assert!(matches!(
            err,
            BankError::PrepareFailure { source: StorageError::InsufficientFunds { .. }, .. }
        ));
        assert_eq!(balance(&engine, "alice"), 10);
        assert_eq!(balance(&engine, "bob"), 50);
        assert!(log.is_empty());
        for shard in engine.shard_ids() {
            assert!(engine.list_prepared(shard).unwrap().is_empty());
        }
        assert_eq!(coord.total_aborted(), 1);
    }

    #[test]
    fn test_self_transfer_allowed_by_policy_is_noop() {
        let policy = TransferPolicy { require_positive_amount: true, reject_self_transfer: false };
        let (engine, _, coord) = coordinator(2, policy);
        open_account(&engine, "alice", 100);
        let receipt = coord.transfer("alice", "alice", 40).unwrap();
        assert_eq!(receipt.branches.len(), 1);
        assert_eq!(balance(&engine, "alice"), 100);
    }
}
