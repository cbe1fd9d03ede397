//! Fault injection for crash-recovery and failure testing.
//!
//! Simulated failure modes:
//! - Coordinator crash at a fixed point of the 2PC protocol
//! - Intent log write failure at the coordinator commit
//! - Shard call failures (`Unavailable`) for the next N calls of one primitive
//! - Lost replies: the call reaches the shard and takes effect, the caller
//!   still sees `Unavailable`
//! - Whole-shard outage
//!
//! Wire the injector into the coordinator and wrap shard stores in
//! `FaultyShardStore`; both consult it before the operation it guards, and
//! the store consults it again before returning a reply.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use shardbank_common::error::StorageError;
use shardbank_common::types::{GlobalTxnId, ShardId};
use shardbank_storage::{QueryResult, Resolution, ShardStore, Statement};

/// Point in `transfer` where a coordinator crash is simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Destination branch prepared and appended, coordinator txn still open.
    AfterDestinationPrepare,
    /// Both branches prepared and appended, coordinator txn not committed.
    BeforeIntentCommit,
    /// Intents durable, no branch committed yet.
    AfterIntentCommit,
}

impl CrashPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            CrashPoint::AfterDestinationPrepare => "after_destination_prepare",
            CrashPoint::BeforeIntentCommit => "before_intent_commit",
            CrashPoint::AfterIntentCommit => "after_intent_commit",
        }
    }
}

/// Shard primitive a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardOp {
    Execute,
    Prepare,
    CommitPrepared,
    RollbackPrepared,
    ListPrepared,
    ForgetOutcomes,
}

impl fmt::Display for ShardOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardOp::Execute => "execute",
            ShardOp::Prepare => "prepare",
            ShardOp::CommitPrepared => "commit_prepared",
            ShardOp::RollbackPrepared => "rollback_prepared",
            ShardOp::ListPrepared => "list_prepared",
            ShardOp::ForgetOutcomes => "forget_outcomes",
        };
        f.write_str(s)
    }
}

/// Shared fault state. Every fault is inert until armed.
pub struct FaultInjector {
    crash_point: Mutex<Option<CrashPoint>>,
    intent_commit_failure: AtomicBool,
    /// Remaining injected failures per (shard, primitive).
    shard_failures: Mutex<HashMap<(ShardId, ShardOp), u32>>,
    /// Remaining replies to drop per (shard, primitive).
    lost_replies: Mutex<HashMap<(ShardId, ShardOp), u32>>,
    unavailable: Mutex<HashSet<ShardId>>,
    faults_fired: AtomicU64,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            crash_point: Mutex::new(None),
            intent_commit_failure: AtomicBool::new(false),
            shard_failures: Mutex::new(HashMap::new()),
            lost_replies: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
            faults_fired: AtomicU64::new(0),
        }
    }

    // ── Coordinator crash ──

    /// Arm a one-shot coordinator crash at `point`.
    pub fn arm_crash(&self, point: CrashPoint) {
        *self.crash_point.lock() = Some(point);
    }

    /// Consume the crash if it is armed at `point`.
    pub fn take_crash(&self, point: CrashPoint) -> bool {
        let mut armed = self.crash_point.lock();
        if *armed == Some(point) {
            *armed = None;
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(point = point.as_str(), "injected coordinator crash");
            true
        } else {
            false
        }
    }

    // ── Intent log ──

    /// Arm a one-shot failure of the next coordinator commit.
    pub fn arm_intent_commit_failure(&self) {
        self.intent_commit_failure.store(true, Ordering::SeqCst);
    }

    pub fn take_intent_commit_failure(&self) -> bool {
        let was_armed = self.intent_commit_failure.swap(false, Ordering::SeqCst);
        if was_armed {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
        }
        was_armed
    }

    // ── Shard faults ──

    /// Fail the next `times` calls of `op` on `shard` with `Unavailable`.
    pub fn fail_next(&self, shard: ShardId, op: ShardOp, times: u32) {
        self.shard_failures.lock().insert((shard, op), times);
    }

    /// Take `shard` down (or bring it back) for every primitive.
    pub fn set_shard_unavailable(&self, shard: ShardId, down: bool) {
        let mut unavailable = self.unavailable.lock();
        if down {
            unavailable.insert(shard);
            tracing::warn!(shard = shard.0, "injected shard outage");
        } else if unavailable.remove(&shard) {
            tracing::info!(shard = shard.0, "shard outage healed");
        }
    }

    pub fn is_shard_unavailable(&self, shard: ShardId) -> bool {
        self.unavailable.lock().contains(&shard)
    }

    /// Let the next `times` calls of `op` on `shard` run, then drop their
    /// replies with `Unavailable`.
    pub fn lose_reply(&self, shard: ShardId, op: ShardOp, times: u32) {
        self.lost_replies.lock().insert((shard, op), times);
    }

    /// Gate one shard call. Returns the injected error if a fault fires.
    pub fn check(&self, shard: ShardId, op: ShardOp) -> Result<(), StorageError> {
        if self.is_shard_unavailable(shard) {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Unavailable(format!("{} is down", shard)));
        }
        if self.fire(&self.shard_failures, shard, op) {
            return Err(StorageError::Unavailable(format!("injected {} failure on {}", op, shard)));
        }
        Ok(())
    }

    /// Gate the reply of a shard call that has already run.
    pub fn check_reply(&self, shard: ShardId, op: ShardOp) -> Result<(), StorageError> {
        if self.fire(&self.lost_replies, shard, op) {
            tracing::warn!(shard = shard.0, %op, "injected lost reply");
            return Err(StorageError::Unavailable(format!("reply from {} lost after {}", shard, op)));
        }
        Ok(())
    }

    /// Count down one armed (shard, op) fault; true if it fired.
    fn fire(&self, armed: &Mutex<HashMap<(ShardId, ShardOp), u32>>, shard: ShardId, op: ShardOp) -> bool {
        let mut armed = armed.lock();
        let Some(remaining) = armed.get_mut(&(shard, op)) else {
            return false;
        };
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        if *remaining == 0 {
            armed.remove(&(shard, op));
        }
        self.faults_fired.fetch_add(1, Ordering::Relaxed);
        true
    }

    // ── Observability ──

    /// Total number of faults that have fired.
    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    /// Disarm every fault and reset counters.
    pub fn reset(&self) {
        *self.crash_point.lock() = None;
        self.intent_commit_failure.store(false, Ordering::SeqCst);
        self.shard_failures.lock().clear();
        self.lost_replies.lock().clear();
        self.unavailable.lock().clear();
        self.faults_fired.store(0, Ordering::Relaxed);
    }
}

/// `ShardStore` wrapper that consults a `FaultInjector` around every call.
pub struct FaultyShardStore {
    inner: Arc<dyn ShardStore>,
    faults: Arc<FaultInjector>,
}

impl FaultyShardStore {
    pub fn new(inner: Arc<dyn ShardStore>, faults: Arc<FaultInjector>) -> Self {
        Self { inner, faults }
    }
}

impl ShardStore for FaultyShardStore {
    fn shard_id(&self) -> ShardId {
        self.inner.shard_id()
    }

    fn execute(&self, stmt: &Statement) -> Result<QueryResult, StorageError> {
        self.faults.check(self.shard_id(), ShardOp::Execute)?;
        let reply = self.inner.execute(stmt)?;
        self.faults.check_reply(self.shard_id(), ShardOp::Execute)?;
        Ok(reply)
    }

    fn prepare_transaction(&self, gid: &GlobalTxnId, stmts: &[Statement]) -> Result<(), StorageError> {
        self.faults.check(self.shard_id(), ShardOp::Prepare)?;
        let reply = self.inner.prepare_transaction(gid, stmts)?;
        self.faults.check_reply(self.shard_id(), ShardOp::Prepare)?;
        Ok(reply)
    }

    fn commit_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        self.faults.check(self.shard_id(), ShardOp::CommitPrepared)?;
        let reply = self.inner.commit_prepared(gid)?;
        self.faults.check_reply(self.shard_id(), ShardOp::CommitPrepared)?;
        Ok(reply)
    }

    fn rollback_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        self.faults.check(self.shard_id(), ShardOp::RollbackPrepared)?;
        let reply = self.inner.rollback_prepared(gid)?;
        self.faults.check_reply(self.shard_id(), ShardOp::RollbackPrepared)?;
        Ok(reply)
    }

    fn list_prepared(&self) -> Result<Vec<GlobalTxnId>, StorageError> {
        self.faults.check(self.shard_id(), ShardOp::ListPrepared)?;
        let reply = self.inner.list_prepared()?;
        self.faults.check_reply(self.shard_id(), ShardOp::ListPrepared)?;
        Ok(reply)
    }

    fn forget_outcomes(&self, keep: &HashSet<GlobalTxnId>) -> Result<usize, StorageError> {
        self.faults.check(self.shard_id(), ShardOp::ForgetOutcomes)?;
        let reply = self.inner.forget_outcomes(keep)?;
        self.faults.check_reply(self.shard_id(), ShardOp::ForgetOutcomes)?;
        Ok(reply)
    }
}
