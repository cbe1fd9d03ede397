//! Recovery sweeper: drives every in-doubt branch to its durable decision.
//!
//! A sweep runs under the intent log lock, so it never interleaves with a
//! transfer's prepare/log steps:
//!
//! 0. If the last intent log write failed, rewrite the log first. Until
//!    that succeeds nothing is committed or rolled back.
//! 1. `COMMIT PREPARED` every logged branch. Already committed is success.
//! 2. Stage clearing the intent log.
//! 3. On every shard, `ROLLBACK PREPARED` each prepared id that is not logged.
//! 4. Checkpoint the coordinator transaction, which makes step 2 durable.
//! 5. Let shards forget outcomes of ids the log no longer references.
//!
//! # Invariants
//! - A logged branch is never rolled back. When its shard cannot be reached
//!   the entry stays in the log and its id is skipped in step 3 everywhere.
//! - Retryable shard errors are retried with exponential backoff. Exhausting
//!   the retries halts that shard for the rest of the sweep only.
//! - A sweep is idempotent: running it twice in a row changes nothing the
//!   second time.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use shardbank_common::config::RecoveryConfig;
use shardbank_common::error::{BankError, BankResult, StorageError};
use shardbank_common::types::{GlobalTxnId, ShardId};
use shardbank_storage::{IntentEntry, IntentLog, IntentLogTxn, Resolution};

use crate::sharded_engine::ShardedEngine;

/// Retry policy for shard calls made during recovery.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retry).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Cap on a single backoff.
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g. 2.0 for doubling).
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for RetryConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryConfig {
    /// Backoff before the nth retry (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_micros() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_micros() as f64) as u64;
        Duration::from_micros(capped)
    }
}

/// What one sweep did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Logged branches committed by this sweep.
    pub committed: Vec<IntentEntry>,
    /// Logged branches the shard had already committed.
    pub already_committed: usize,
    /// Unlogged prepared branches rolled back by this sweep.
    pub rolled_back: Vec<(ShardId, GlobalTxnId)>,
    /// Entries left in the log because their shard was halted.
    pub retained: Vec<IntentEntry>,
    pub halted_shards: Vec<ShardId>,
    pub errors: Vec<BankError>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Nothing was committed, rolled back or retained.
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
            && self.already_committed == 0
            && self.rolled_back.is_empty()
            && self.retained.is_empty()
            && self.errors.is_empty()
    }
}

/// Cumulative sweeper metrics.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    pub sweeps_run: u64,
    /// Branches committed across all sweeps.
    pub committed: u64,
    /// Branches rolled back across all sweeps.
    pub rolled_back: u64,
    /// Errors reported across all sweeps.
    pub failures: u64,
    /// Retried shard calls across all sweeps.
    pub retries: u64,
    /// Entries retained by the last sweep.
    pub retained: usize,
    /// Last sweep duration in microseconds.
    pub last_sweep_us: u64,
}

pub struct RecoverySweeper {
    engine: Arc<ShardedEngine>,
    intent_log: Arc<IntentLog>,
    retry: RetryConfig,
    sweep_interval: Duration,
    metrics: RwLock<RecoveryMetrics>,
}

impl RecoverySweeper {
    pub fn new(
        engine: Arc<ShardedEngine>,
        intent_log: Arc<IntentLog>,
        config: &RecoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            intent_log,
            retry: RetryConfig::from(config),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            metrics: RwLock::new(RecoveryMetrics::default()),
        })
    }

    /// Run one sweep. Returns the first error, if any, after the whole
    /// sweep has run.
    pub fn reconcile(&self) -> BankResult<RecoveryReport> {
        first_error(self.sweep())
    }

    /// `reconcile` inside a critical section the caller already holds.
    pub fn reconcile_locked(&self, txn: &mut IntentLogTxn<'_>) -> BankResult<RecoveryReport> {
        first_error(self.sweep_locked(txn))
    }

    /// Run one sweep and return everything it did, errors included.
    pub fn sweep(&self) -> RecoveryReport {
        self.sweep_locked(&mut self.intent_log.begin())
    }

    /// Sweep under an open intent log transaction. Staged changes of `txn`
    /// are discarded first; the cleared log is checkpointed at the end and
    /// the lock stays with the caller.
    pub fn sweep_locked(&self, txn: &mut IntentLogTxn<'_>) -> RecoveryReport {
        let start = Instant::now();
        let mut report = RecoveryReport::default();
        let mut halted: BTreeSet<ShardId> = BTreeSet::new();
        let mut retries = 0u64;

        txn.discard();
        let entries = txn.entries().to_vec();

        if txn.is_poisoned() {
            txn.reset(entries.clone());
            if let Err(source) = txn.checkpoint() {
                tracing::error!(error = %source, "intent log cannot be settled, sweep skipped");
                report.errors.push(BankError::LogWriteFailure {
                    context: "settle intent log after failed write".into(),
                    source,
                });
                report.retained = entries;
                halted.extend(self.engine.shard_ids());
                return self.finish(report, halted, retries, start);
            }
        }

        for entry in entries {
            let shard = entry.shard_id;
            if halted.contains(&shard) {
                report.retained.push(entry);
                continue;
            }
            let result = self.with_retry(shard, "commit_prepared", &mut retries, || {
                self.engine.commit_prepared(shard, &entry.txn_id)
            });
            match result {
                Ok(Resolution::Applied) => report.committed.push(entry),
                Ok(Resolution::AlreadyCommitted) => report.already_committed += 1,
                Ok(resolution) => {
                    tracing::error!(
                        txn_id = %entry.txn_id,
                        shard = shard.0,
                        %resolution,
                        "logged branch cannot be committed"
                    );
                    report.errors.push(BankError::RecoveryInconsistency {
                        txn_id: entry.txn_id,
                        shard,
                        detail: format!("COMMIT PREPARED answered {}", resolution),
                    });
                }
                Err(e) => {
                    halted.insert(shard);
                    report.retained.push(entry);
                    report.errors.push(e);
                }
            }
        }

        txn.reset(report.retained.clone());
        let retained_ids: HashSet<GlobalTxnId> =
            report.retained.iter().map(|e| e.txn_id.clone()).collect();

        for shard in self.engine.shard_ids() {
            if halted.contains(&shard) {
                continue;
            }
            let prepared = match self.with_retry(shard, "list_prepared", &mut retries, || {
                self.engine.list_prepared(shard)
            }) {
                Ok(prepared) => prepared,
                Err(e) => {
                    halted.insert(shard);
                    report.errors.push(e);
                    continue;
                }
            };
            for gid in prepared {
                if retained_ids.contains(&gid) {
                    continue;
                }
                let result = self.with_retry(shard, "rollback_prepared", &mut retries, || {
                    self.engine.rollback_prepared(shard, &gid)
                });
                match result {
                    Ok(Resolution::Applied) => {
                        tracing::info!(txn_id = %gid, shard = shard.0, "rolled back unlogged branch");
                        report.rolled_back.push((shard, gid));
                    }
                    Ok(resolution) => {
                        tracing::debug!(txn_id = %gid, shard = shard.0, %resolution, "branch already resolved");
                    }
                    Err(e) => {
                        halted.insert(shard);
                        report.errors.push(e);
                        break;
                    }
                }
            }
        }

        match txn.checkpoint() {
            Ok(remaining) => {
                shardbank_observability::record_intent_log_size(remaining);
                self.forget_outcomes(&halted, &retained_ids);
            }
            Err(source) => {
                tracing::error!(error = %source, "failed to clear intent log");
                report.errors.push(BankError::LogWriteFailure {
                    context: "clear intent log".into(),
                    source,
                });
            }
        }

        self.finish(report, halted, retries, start)
    }

    /// Outcomes of ids outside the log are no longer needed by any sweep.
    fn forget_outcomes(&self, halted: &BTreeSet<ShardId>, keep: &HashSet<GlobalTxnId>) {
        for shard in self.engine.shard_ids() {
            if halted.contains(&shard) {
                continue;
            }
            if let Err(e) = self.engine.forget_outcomes(shard, keep) {
                tracing::warn!(shard = shard.0, error = %e, "failed to forget resolved outcomes");
            }
        }
    }

    fn finish(
        &self,
        mut report: RecoveryReport,
        halted: BTreeSet<ShardId>,
        retries: u64,
        start: Instant,
    ) -> RecoveryReport {
        report.halted_shards = halted.into_iter().collect();
        let elapsed_us = start.elapsed().as_micros() as u64;
        {
            let mut m = self.metrics.write();
            m.sweeps_run += 1;
            m.committed += report.committed.len() as u64;
            m.rolled_back += report.rolled_back.len() as u64;
            m.failures += report.errors.len() as u64;
            m.retries += retries;
            m.retained = report.retained.len();
            m.last_sweep_us = elapsed_us;
        }
        shardbank_observability::record_sweep(
            report.committed.len(),
            report.rolled_back.len(),
            report.halted_shards.len(),
            elapsed_us,
        );
        if !report.is_noop() {
            tracing::info!(
                committed = report.committed.len(),
                already_committed = report.already_committed,
                rolled_back = report.rolled_back.len(),
                retained = report.retained.len(),
                errors = report.errors.len(),
                elapsed_us,
                "recovery sweep completed"
            );
        }
        report
    }

    /// Run `op` against `shard`, retrying retryable errors with backoff.
    fn with_retry<T>(
        &self,
        shard: ShardId,
        op: &'static str,
        retries: &mut u64,
        mut f: impl FnMut() -> Result<T, StorageError>,
    ) -> BankResult<T> {
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        shard = shard.0,
                        op,
                        attempts = attempt + 1,
                        backoff_us = backoff.as_micros() as u64,
                        error = %e,
                        "recovery call failed, will retry"
                    );
                    shardbank_observability::record_sweep_retry(shard.0);
                    *retries += 1;
                    std::thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(
                        shard = shard.0,
                        op,
                        attempts = attempt + 1,
                        error = %e,
                        "recovery halted on shard, retries exhausted"
                    );
                    return Err(BankError::RecoveryExhausted {
                        shard,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::error!(shard = shard.0, op, error = %e, "recovery halted on shard");
                    return Err(BankError::Storage { shard, source: e });
                }
            }
        }
    }

    /// Start the background sweeper thread. Returns a handle to stop it.
    pub fn start(self: &Arc<Self>) -> BankResult<SweeperHandle> {
        let sweeper = Arc::clone(self);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = Arc::clone(&stop_flag);

        let thread = std::thread::Builder::new()
            .name("shardbank-recovery-sweeper".into())
            .spawn(move || {
                tracing::info!("recovery sweeper started");
                while !stop_flag_clone.load(Ordering::Relaxed) {
                    let report = sweeper.sweep();
                    for e in &report.errors {
                        tracing::warn!(error = %e, "background recovery sweep reported an error");
                    }
                    std::thread::park_timeout(sweeper.sweep_interval);
                }
                tracing::info!("recovery sweeper stopped");
            })
            .map_err(|e| {
                BankError::internal_bug(
                    "E-SWEEP-001",
                    "failed to spawn recovery sweeper thread",
                    e.to_string(),
                )
            })?;

        Ok(SweeperHandle {
            stop: stop_flag,
            thread: Some(thread),
        })
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> RecoveryMetrics {
        self.metrics.read().clone()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}

fn first_error(mut report: RecoveryReport) -> BankResult<RecoveryReport> {
    if report.errors.is_empty() {
        Ok(report)
    } else {
        Err(report.errors.swap_remove(0))
    }
}

/// Handle to the background sweeper thread.
pub struct SweeperHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            t.thread().unpark();
            let _ = t.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
