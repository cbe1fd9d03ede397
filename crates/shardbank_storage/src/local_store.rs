//! In-process shard store with PostgreSQL-style prepared transactions.
//!
//! State: committed `accounts`, the `prepared` set keyed by global id, row
//! locks held by prepared transactions, and the terminal outcome of every
//! id this store has resolved. With a data directory, every state change is
//! written to `shard.wal` before it is applied in memory, and the file is
//! replayed and compacted on open. A prepared transaction therefore survives
//! a crash exactly like a PostgreSQL `PREPARE TRANSACTION`.
//!
//! Outcomes are kept until more than `outcome_retention` pile up; the next
//! `forget_outcomes` then drops every one the coordinator no longer needs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use shardbank_common::config::ShardConfig;
use shardbank_common::error::StorageError;
use shardbank_common::types::{Amount, GlobalTxnId, ShardId};

use crate::shard_store::{QueryResult, Resolution, ShardStore, Statement};
use crate::wal::{read_records, SyncMode, WalWriter};

const SHARD_WAL_FILENAME: &str = "shard.wal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Outcome {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ShardRecord {
    /// Full state, written at compaction.
    Snapshot {
        accounts: Vec<(String, Amount)>,
        prepared: Vec<(GlobalTxnId, Vec<Statement>)>,
        outcomes: Vec<(GlobalTxnId, Outcome)>,
    },
    /// Autocommit mutation.
    Apply { stmt: Statement },
    Prepare { gid: GlobalTxnId, writes: Vec<Statement> },
    CommitPrepared { gid: GlobalTxnId },
    RollbackPrepared { gid: GlobalTxnId },
    /// Outcomes outside `keep` were dropped.
    ForgetOutcomes { keep: Vec<GlobalTxnId> },
}

#[derive(Default)]
struct ShardState {
    accounts: BTreeMap<String, Amount>,
    prepared: BTreeMap<GlobalTxnId, Vec<Statement>>,
    row_locks: HashMap<String, GlobalTxnId>,
    outcomes: HashMap<GlobalTxnId, Outcome>,
    wal: Option<WalWriter<ShardRecord>>,
}

impl ShardState {
    fn log(&mut self, record: &ShardRecord) -> Result<(), StorageError> {
        match self.wal.as_mut() {
            Some(wal) => wal.append(record),
            None => Ok(()),
        }
    }

    fn lock_rows(&mut self, gid: &GlobalTxnId, writes: &[Statement]) {
        for key in writes.iter().filter_map(Statement::row_key) {
            self.row_locks.insert(key.to_string(), gid.clone());
        }
    }

    fn release_rows(&mut self, gid: &GlobalTxnId) {
        self.row_locks.retain(|_, owner| owner != gid);
    }

    /// Resolution for an id that is not currently prepared.
    fn resolved(&self, gid: &GlobalTxnId) -> Resolution {
        match self.outcomes.get(gid) {
            Some(Outcome::Committed) => Resolution::AlreadyCommitted,
            Some(Outcome::RolledBack) => Resolution::AlreadyRolledBack,
            None => Resolution::Unknown,
        }
    }

    fn finish(&mut self, gid: &GlobalTxnId, outcome: Outcome) {
        if let Some(writes) = self.prepared.remove(gid) {
            if outcome == Outcome::Committed {
                apply_writes(&mut self.accounts, &writes);
            }
        }
        self.release_rows(gid);
        self.outcomes.insert(gid.clone(), outcome);
    }

    fn replay(&mut self, record: ShardRecord) {
        match record {
            ShardRecord::Snapshot { accounts, prepared, outcomes } => {
                self.accounts = accounts.into_iter().collect();
                self.prepared = prepared.into_iter().collect();
                self.outcomes = outcomes.into_iter().collect();
            }
            ShardRecord::Apply { stmt } => apply_writes(&mut self.accounts, std::slice::from_ref(&stmt)),
            ShardRecord::Prepare { gid, writes } => {
                self.prepared.insert(gid, writes);
            }
            ShardRecord::CommitPrepared { gid } => self.finish(&gid, Outcome::Committed),
            ShardRecord::RollbackPrepared { gid } => self.finish(&gid, Outcome::RolledBack),
            ShardRecord::ForgetOutcomes { keep } => {
                let keep: HashSet<GlobalTxnId> = keep.into_iter().collect();
                self.outcomes.retain(|gid, _| keep.contains(gid));
            }
        }
    }

    fn snapshot_record(&self) -> ShardRecord {
        ShardRecord::Snapshot {
            accounts: self.accounts.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            prepared: self.prepared.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            outcomes: self.outcomes.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

/// Apply already-validated writes to committed state.
fn apply_writes(accounts: &mut BTreeMap<String, Amount>, writes: &[Statement]) {
    for stmt in writes {
        match stmt {
            Statement::InsertAccount { name, balance } => {
                accounts.insert(name.clone(), *balance);
            }
            Statement::AdjustBalance { name, delta } => {
                let balance = accounts.entry(name.clone()).or_insert(0);
                *balance = balance.saturating_add(*delta);
            }
            Statement::SelectBalance { .. } | Statement::SumBalances => {}
        }
    }
}

/// In-process shard store. See the module docs.
pub struct LocalShardStore {
    shard_id: ShardId,
    state: Mutex<ShardState>,
    row_released: Condvar,
    lock_wait_timeout: Duration,
    allow_negative_balance: bool,
    outcome_retention: usize,
}

impl LocalShardStore {
    /// Volatile store with default settings.
    pub fn in_memory(shard_id: ShardId) -> Self {
        Self::with_state(shard_id, ShardState::default(), &ShardConfig::default())
    }

    /// Open per `config`: durable when `config.data_dir` is set, else volatile.
    pub fn open(shard_id: ShardId, config: &ShardConfig) -> Result<Self, StorageError> {
        if config.data_dir.is_empty() {
            return Ok(Self::with_state(shard_id, ShardState::default(), config));
        }

        let path = Path::new(&config.data_dir).join(SHARD_WAL_FILENAME);
        let mut state = ShardState::default();
        for record in read_records::<ShardRecord>(&path)? {
            state.replay(record);
        }
        let prepared: Vec<(GlobalTxnId, Vec<Statement>)> =
            state.prepared.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (gid, writes) in &prepared {
            state.lock_rows(gid, writes);
        }

        let mut wal = WalWriter::open(&path, SyncMode::parse(&config.sync_mode)?)?;
        wal.rewrite(&[state.snapshot_record()])?;
        state.wal = Some(wal);

        tracing::info!(
            shard = shard_id.0,
            accounts = state.accounts.len(),
            prepared = state.prepared.len(),
            "shard store recovered from {}",
            path.display()
        );
        Ok(Self::with_state(shard_id, state, config))
    }

    fn with_state(shard_id: ShardId, state: ShardState, config: &ShardConfig) -> Self {
        Self {
            shard_id,
            state: Mutex::new(state),
            row_released: Condvar::new(),
            lock_wait_timeout: config.lock_wait_timeout(),
            allow_negative_balance: config.allow_negative_balance,
            outcome_retention: config.outcome_retention,
        }
    }

    /// Number of transactions currently prepared on this store.
    pub fn prepared_count(&self) -> usize {
        self.state.lock().prepared.len()
    }

    pub fn is_prepared(&self, gid: &GlobalTxnId) -> bool {
        self.state.lock().prepared.contains_key(gid)
    }

    /// Resolved ids whose outcome is still remembered.
    pub fn remembered_outcomes(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    /// Block until none of `rows` is held by a prepared transaction.
    fn wait_for_rows(
        &self,
        state: &mut MutexGuard<'_, ShardState>,
        rows: &BTreeSet<String>,
    ) -> Result<(), StorageError> {
        let deadline = Instant::now() + self.lock_wait_timeout;
        loop {
            let Some(blocked) = rows.iter().find(|r| state.row_locks.contains_key(*r)) else {
                return Ok(());
            };
            if Instant::now() >= deadline {
                tracing::debug!(
                    shard = self.shard_id.0,
                    row = %blocked,
                    holder = %state.row_locks[blocked],
                    "lock wait timeout"
                );
                return Err(StorageError::LockTimeout(blocked.clone()));
            }
            self.row_released.wait_until(state, deadline);
        }
    }

    /// Check every write against committed state without applying it.
    fn validate_writes(
        &self,
        accounts: &BTreeMap<String, Amount>,
        writes: &[Statement],
    ) -> Result<(), StorageError> {
        let mut overlay: HashMap<&str, Amount> = HashMap::new();
        for stmt in writes {
            match stmt {
                Statement::InsertAccount { name, balance } => {
                    if accounts.contains_key(name) || overlay.contains_key(name.as_str()) {
                        return Err(StorageError::AccountExists(name.clone()));
                    }
                    if *balance < 0 && !self.allow_negative_balance {
                        return Err(StorageError::InsufficientFunds {
                            account: name.clone(),
                            balance: 0,
                            delta: *balance,
                        });
                    }
                    overlay.insert(name, *balance);
                }
                Statement::AdjustBalance { name, delta } => {
                    let current = match overlay.get(name.as_str()) {
                        Some(v) => *v,
                        None => *accounts
                            .get(name)
                            .ok_or_else(|| StorageError::AccountNotFound(name.clone()))?,
                    };
                    let next = current
                        .checked_add(*delta)
                        .ok_or_else(|| StorageError::BalanceOverflow(name.clone()))?;
                    if next < 0 && !self.allow_negative_balance {
                        return Err(StorageError::InsufficientFunds {
                            account: name.clone(),
                            balance: current,
                            delta: *delta,
                        });
                    }
                    overlay.insert(name, next);
                }
                other => return Err(StorageError::NotMutating(other.to_string())),
            }
        }
        Ok(())
    }
}

fn rows_of(stmts: &[Statement]) -> BTreeSet<String> {
    stmts.iter().filter_map(Statement::row_key).map(str::to_string).collect()
}

impl ShardStore for LocalShardStore {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn execute(&self, stmt: &Statement) -> Result<QueryResult, StorageError> {
        let mut guard = self.state.lock();
        match stmt {
            Statement::SelectBalance { name } => guard
                .accounts
                .get(name)
                .map(|b| QueryResult::Scalar(*b))
                .ok_or_else(|| StorageError::AccountNotFound(name.clone())),
            Statement::SumBalances => {
                let sum = guard
                    .accounts
                    .values()
                    .try_fold(0i64, |acc, b| acc.checked_add(*b))
                    .ok_or_else(|| StorageError::BalanceOverflow("SUM(balance)".into()))?;
                Ok(QueryResult::Scalar(sum))
            }
            Statement::InsertAccount { .. } | Statement::AdjustBalance { .. } => {
                let writes = std::slice::from_ref(stmt);
                self.wait_for_rows(&mut guard, &rows_of(writes))?;
                self.validate_writes(&guard.accounts, writes)?;
                guard.log(&ShardRecord::Apply { stmt: stmt.clone() })?;
                apply_writes(&mut guard.accounts, writes);
                Ok(QueryResult::Affected(1))
            }
        }
    }

    fn prepare_transaction(&self, gid: &GlobalTxnId, stmts: &[Statement]) -> Result<(), StorageError> {
        if let Some(stmt) = stmts.iter().find(|s| !s.is_mutation()) {
            return Err(StorageError::NotMutating(stmt.to_string()));
        }
        let mut guard = self.state.lock();
        if guard.prepared.contains_key(gid) || guard.outcomes.contains_key(gid) {
            return Err(StorageError::DuplicateTransaction(gid.clone()));
        }
        self.wait_for_rows(&mut guard, &rows_of(stmts))?;
        self.validate_writes(&guard.accounts, stmts)?;

        guard.log(&ShardRecord::Prepare { gid: gid.clone(), writes: stmts.to_vec() })?;
        guard.lock_rows(gid, stmts);
        guard.prepared.insert(gid.clone(), stmts.to_vec());
        Ok(())
    }

    fn commit_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        let mut guard = self.state.lock();
        if !guard.prepared.contains_key(gid) {
            return Ok(guard.resolved(gid));
        }
        guard.log(&ShardRecord::CommitPrepared { gid: gid.clone() })?;
        guard.finish(gid, Outcome::Committed);
        drop(guard);
        self.row_released.notify_all();
        Ok(Resolution::Applied)
    }

    fn rollback_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError> {
        let mut guard = self.state.lock();
        if !guard.prepared.contains_key(gid) {
            return Ok(guard.resolved(gid));
        }
        guard.log(&ShardRecord::RollbackPrepared { gid: gid.clone() })?;
        guard.finish(gid, Outcome::RolledBack);
        drop(guard);
        self.row_released.notify_all();
        Ok(Resolution::Applied)
    }

    fn list_prepared(&self) -> Result<Vec<GlobalTxnId>, StorageError> {
        Ok(self.state.lock().prepared.keys().cloned().collect())
    }

    fn forget_outcomes(&self, keep: &HashSet<GlobalTxnId>) -> Result<usize, StorageError> {
        let mut guard = self.state.lock();
        if guard.outcomes.len() <= self.outcome_retention {
            return Ok(0);
        }
        let kept: Vec<GlobalTxnId> = guard.outcomes.keys().filter(|gid| keep.contains(*gid)).cloned().collect();
        guard.log(&ShardRecord::ForgetOutcomes { keep: kept })?;
        let before = guard.outcomes.len();
        guard.outcomes.retain(|gid, _| keep.contains(gid));
        let forgotten = before - guard.outcomes.len();
        tracing::debug!(shard = self.shard_id.0, forgotten, "resolved outcomes forgotten");
        Ok(forgotten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn gid(s: &str) -> GlobalTxnId {
        GlobalTxnId::from(s)
    }

    fn store_with(accounts: &[(&str, Amount)]) -> LocalShardStore {
        let store = LocalShardStore::in_memory(ShardId(0));
        for (name, balance) in accounts {
            store
                .execute(&Statement::InsertAccount { name: name.to_string(), balance: *balance })
                .unwrap();
        }
        store
    }

    fn balance(store: &LocalShardStore, name: &str) -> Amount {
        store
            .execute(&Statement::SelectBalance { name: name.into() })
            .unwrap()
            .scalar()
            .unwrap()
    }

    fn durable_config(dir: &TempDir) -> ShardConfig {
        ShardConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            sync_mode: "none".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepared_changes_invisible_until_commit() {
        let store = store_with(&[("bob", 50)]);
        store.prepare_transaction(&gid("t1"), &[Statement::credit("bob", 30)]).unwrap();
        assert_eq!(balance(&store, "bob"), 50);
        assert_eq!(store.list_prepared().unwrap(), vec![gid("t1")]);
        assert!(store.is_prepared(&gid("t1")));
        assert_eq!(store.prepared_count(), 1);

        assert_eq!(store.commit_prepared(&gid("t1")).unwrap(), Resolution::Applied);
        assert_eq!(balance(&store, "bob"), 80);
        assert!(store.list_prepared().unwrap().is_empty());
        assert!(!store.is_prepared(&gid("t1")));
        assert_eq!(store.prepared_count(), 0);
    }

    #[test]
    fn test_commit_prepared_is_idempotent() {
        let store = store_with(&[("bob", 50)]);
        store.prepare_transaction(&gid("t1"), &[Statement::credit("bob", 30)]).unwrap();
        store.commit_prepared(&gid("t1")).unwrap();
        assert_eq!(store.commit_prepared(&gid("t1")).unwrap(), Resolution::AlreadyCommitted);
        assert_eq!(balance(&store, "bob"), 80);
    }

    #[test]
    fn test_rollback_discards_and_reports_history() {
        let store = store_with(&[("alice", 100)]);
        store.prepare_transaction(&gid("t2"), &[Statement::debit("alice", 30).unwrap()]).unwrap();
        assert_eq!(store.rollback_prepared(&gid("t2")).unwrap(), Resolution::Applied);
        assert_eq!(balance(&store, "alice"), 100);
        assert_eq!(store.rollback_prepared(&gid("t2")).unwrap(), Resolution::AlreadyRolledBack);
        assert_eq!(store.commit_prepared(&gid("t2")).unwrap(), Resolution::AlreadyRolledBack);
    }

    #[test]
    fn test_unknown_gid() {
        let store = store_with(&[]);
        assert_eq!(store.commit_prepared(&gid("never")).unwrap(), Resolution::Unknown);
        assert_eq!(store.rollback_prepared(&gid("never")).unwrap(), Resolution::Unknown);
    }

    #[test]
    fn test_duplicate_gid_rejected() {
        let store = store_with(&[("a", 10), ("b", 10)]);
        store.prepare_transaction(&gid("t"), &[Statement::credit("a", 1)]).unwrap();
        let err = store.prepare_transaction(&gid("t"), &[Statement::credit("b", 1)]).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateTransaction(_)));

        // Still rejected once resolved.
        store.commit_prepared(&gid("t")).unwrap();
        let err = store.prepare_transaction(&gid("t"), &[Statement::credit("b", 1)]).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateTransaction(_)));
    }

    #[test]
    fn test_insufficient_funds_fails_prepare() {
        let store = store_with(&[("alice", 20)]);
        let err = store.prepare_transaction(&gid("t"), &[Statement::debit("alice", 30).unwrap()]).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientFunds { balance: 20, delta: -30, .. }));
        assert!(store.list_prepared().unwrap().is_empty());
    }

    #[test]
    fn test_negative_balance_allowed_when_configured() {
        let config = ShardConfig { allow_negative_balance: true, ..Default::default() };
        let store = LocalShardStore::open(ShardId(0), &config).unwrap();
        store.execute(&Statement::InsertAccount { name: "x".into(), balance: 0 }).unwrap();
        store.prepare_transaction(&gid("t"), &[Statement::debit("x", 5).unwrap()]).unwrap();
        store.commit_prepared(&gid("t")).unwrap();
        assert_eq!(balance(&store, "x"), -5);
    }

    #[test]
    fn test_missing_account_fails_prepare() {
        let store = store_with(&[]);
        let err = store.prepare_transaction(&gid("t"), &[Statement::credit("ghost", 1)]).unwrap_err();
        assert!(matches!(err, StorageError::AccountNotFound(_)));
    }

    #[test]
    fn test_read_statement_cannot_be_prepared() {
        let store = store_with(&[("a", 1)]);
        let err = store
            .prepare_transaction(&gid("t"), &[Statement::SelectBalance { name: "a".into() }])
            .unwrap_err();
        assert!(matches!(err, StorageError::NotMutating(_)));
    }

    #[test]
    fn test_batch_sees_its_own_writes() {
        let store = store_with(&[("a", 10)]);
        // Debit then credit the same row inside one branch.
        store
            .prepare_transaction(&gid("t"), &[Statement::credit("a", 5), Statement::debit("a", 15).unwrap()])
            .unwrap();
        store.commit_prepared(&gid("t")).unwrap();
        assert_eq!(balance(&store, "a"), 0);
    }

    #[test]
    fn test_row_lock_times_out() {
        let config = ShardConfig { lock_wait_timeout_ms: 20, ..Default::default() };
        let store = LocalShardStore::open(ShardId(0), &config).unwrap();
        store.execute(&Statement::InsertAccount { name: "a".into(), balance: 10 }).unwrap();
        store.prepare_transaction(&gid("t1"), &[Statement::credit("a", 1)]).unwrap();

        let err = store.prepare_transaction(&gid("t2"), &[Statement::credit("a", 1)]).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout(ref row) if row == "a"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_row_lock_released_on_commit_wakes_waiter() {
        let config = ShardConfig { lock_wait_timeout_ms: 5_000, ..Default::default() };
        let store = Arc::new(LocalShardStore::open(ShardId(0), &config).unwrap());
        store.execute(&Statement::InsertAccount { name: "a".into(), balance: 10 }).unwrap();
        store.prepare_transaction(&gid("t1"), &[Statement::credit("a", 1)]).unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.execute(&Statement::credit("a", 100)))
        };
        std::thread::sleep(Duration::from_millis(20));
        store.commit_prepared(&gid("t1")).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(balance(&store, "a"), 111);
    }

    #[test]
    fn test_sum_balances_ignores_prepared() {
        let store = store_with(&[("a", 10), ("b", 15)]);
        store.prepare_transaction(&gid("t"), &[Statement::credit("a", 100)]).unwrap();
        assert_eq!(store.execute(&Statement::SumBalances).unwrap(), QueryResult::Scalar(25));
    }

    #[test]
    fn test_prepared_transaction_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalShardStore::open(ShardId(1), &durable_config(&dir)).unwrap();
            store.execute(&Statement::InsertAccount { name: "bob".into(), balance: 50 }).unwrap();
            store.prepare_transaction(&gid("t1"), &[Statement::credit("bob", 30)]).unwrap();
        }
        let store = LocalShardStore::open(ShardId(1), &durable_config(&dir)).unwrap();
        assert_eq!(store.list_prepared().unwrap(), vec![gid("t1")]);
        assert_eq!(balance(&store, "bob"), 50);
        assert_eq!(store.commit_prepared(&gid("t1")).unwrap(), Resolution::Applied);
        assert_eq!(balance(&store, "bob"), 80);
    }

    #[test]
    fn test_resolution_history_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalShardStore::open(ShardId(0), &durable_config(&dir)).unwrap();
            store.execute(&Statement::InsertAccount { name: "a".into(), balance: 5 }).unwrap();
            store.prepare_transaction(&gid("c"), &[Statement::credit("a", 1)]).unwrap();
            store.prepare_transaction(&gid("r"), &[Statement::InsertAccount { name: "z".into(), balance: 0 }]).unwrap();
            store.commit_prepared(&gid("c")).unwrap();
            store.rollback_prepared(&gid("r")).unwrap();
        }
        // Reopen twice to exercise compaction of an already compacted file.
        drop(LocalShardStore::open(ShardId(0), &durable_config(&dir)).unwrap());
        let store = LocalShardStore::open(ShardId(0), &durable_config(&dir)).unwrap();
        assert_eq!(store.commit_prepared(&gid("c")).unwrap(), Resolution::AlreadyCommitted);
        assert_eq!(store.commit_prepared(&gid("r")).unwrap(), Resolution::AlreadyRolledBack);
        assert_eq!(balance(&store, "a"), 6);
        assert!(store.execute(&Statement::SelectBalance { name: "z".into() }).is_err());
    }

    #[test]
    fn test_row_locks_rebuilt_after_restart() {
        let dir = TempDir::new().unwrap();
        let mut config = durable_config(&dir);
        config.lock_wait_timeout_ms = 10;
        {
            let store = LocalShardStore::open(ShardId(0), &config).unwrap();
            store.execute(&Statement::InsertAccount { name: "a".into(), balance: 5 }).unwrap();
            store.prepare_transaction(&gid("t"), &[Statement::credit("a", 1)]).unwrap();
        }
        let store = LocalShardStore::open(ShardId(0), &config).unwrap();
        let err = store.execute(&Statement::credit("a", 1)).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout(_)));
    }

    #[test]
    fn test_forget_outcomes_respects_retention_and_keep_set() {
        let config = ShardConfig { outcome_retention: 2, ..Default::default() };
        let store = LocalShardStore::open(ShardId(0), &config).unwrap();
        store.execute(&Statement::InsertAccount { name: "a".into(), balance: 0 }).unwrap();
        for id in ["t1", "t2"] {
            store.prepare_transaction(&gid(id), &[Statement::credit("a", 1)]).unwrap();
            store.commit_prepared(&gid(id)).unwrap();
        }
        assert_eq!(store.forget_outcomes(&HashSet::new()).unwrap(), 0);
        assert_eq!(store.remembered_outcomes(), 2);

        store.prepare_transaction(&gid("t3"), &[Statement::credit("a", 1)]).unwrap();
        store.rollback_prepared(&gid("t3")).unwrap();
        let keep: HashSet<GlobalTxnId> = [gid("t2")].into_iter().collect();
        assert_eq!(store.forget_outcomes(&keep).unwrap(), 2);
        assert_eq!(store.remembered_outcomes(), 1);
        assert_eq!(store.commit_prepared(&gid("t2")).unwrap(), Resolution::AlreadyCommitted);
        assert_eq!(store.commit_prepared(&gid("t1")).unwrap(), Resolution::Unknown);
        assert_eq!(balance(&store, "a"), 2);
    }

    #[test]
    fn test_compacted_wal_does_not_grow_with_history() {
        fn run(cycles: usize) -> u64 {
            let dir = TempDir::new().unwrap();
            let config = ShardConfig { outcome_retention: 4, ..durable_config(&dir) };
            {
                let store = LocalShardStore::open(ShardId(0), &config).unwrap();
                store.execute(&Statement::InsertAccount { name: "a".into(), balance: 0 }).unwrap();
                for i in 0..cycles {
                    let id = gid(&format!("t_{:04}", i));
                    store.prepare_transaction(&id, &[Statement::credit("a", 1)]).unwrap();
                    store.commit_prepared(&id).unwrap();
                    store.forget_outcomes(&HashSet::new()).unwrap();
                }
                assert!(store.remembered_outcomes() <= 4);
            }
            let store = LocalShardStore::open(ShardId(0), &config).unwrap();
            assert!(store.remembered_outcomes() <= 4);
            assert_eq!(balance(&store, "a"), cycles as Amount);
            std::fs::metadata(dir.path().join(SHARD_WAL_FILENAME)).unwrap().len()
        }
        assert_eq!(run(20), run(400));
    }
}
