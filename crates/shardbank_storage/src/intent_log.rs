//! Coordinator-owned intent log: the `(transaction_id, shard_id)` table that
//! anchors 2PC decisions.
//!
//! # Protocol
//!
//! 1. `begin()` takes the table lock (the single serialization point shared by
//!    the coordinator and the sweeper) and opens a coordinator-local
//!    transaction.
//! 2. `append` / `reset` stage changes inside that transaction only.
//! 3. `commit()` makes every staged change durable with a **single** record.
//!    This is the durable commit point of a global transaction.
//!    `checkpoint()` does the same but keeps the lock, so follow-up work
//!    can run in the same critical section.
//! 4. Dropping the guard without `commit()` discards staged changes, exactly
//!    like a coordinator crash before commit.
//!
//! A failed write may still have reached the file. The table is then
//! poisoned: the next checkpoint always writes, and it writes a full `Reset`,
//! so replay never sees the failed record as the last word.
//!
//! The table also owns the coordinator epoch. Every `open` durably bumps the
//! epoch, so `<prefix>_<epoch>_<seq>` ids never repeat across restarts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use shardbank_common::config::CoordinatorConfig;
use shardbank_common::error::StorageError;
use shardbank_common::types::{GlobalTxnId, ShardId};

use crate::wal::{read_records, SyncMode, WalWriter};

const INTENT_WAL_FILENAME: &str = "intent.wal";

/// One prepared branch recorded before the global decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentEntry {
    pub txn_id: GlobalTxnId,
    pub shard_id: ShardId,
}

impl IntentEntry {
    pub fn new(txn_id: GlobalTxnId, shard_id: ShardId) -> Self {
        Self { txn_id, shard_id }
    }
}

/// Durable record of the intent log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentRecord {
    /// Coordinator epoch started.
    Epoch { epoch: u64 },
    /// Entries committed together by one coordinator transaction.
    Append { entries: Vec<IntentEntry> },
    /// Table contents replaced (truncate keeps `retained`).
    Reset { retained: Vec<IntentEntry> },
}

struct IntentTable {
    entries: Vec<IntentEntry>,
    epoch: u64,
    next_seq: u64,
    wal: Option<WalWriter<IntentRecord>>,
    commits: u64,
    /// Set when a write failed after it may have reached the file.
    poisoned: bool,
}

/// See the module docs.
pub struct IntentLog {
    table: Mutex<IntentTable>,
    txn_id_prefix: String,
    path: Option<PathBuf>,
    fail_next_write: AtomicBool,
}

impl IntentLog {
    /// Volatile log. The epoch is seeded from the wall clock.
    pub fn in_memory(txn_id_prefix: &str) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            table: Mutex::new(IntentTable {
                entries: Vec::new(),
                epoch,
                next_seq: 1,
                wal: None,
                commits: 0,
                poisoned: false,
            }),
            txn_id_prefix: txn_id_prefix.to_string(),
            path: None,
            fail_next_write: AtomicBool::new(false),
        }
    }

    /// Open per `config`: durable when `config.data_dir` is set, else volatile.
    pub fn open(config: &CoordinatorConfig) -> Result<Self, StorageError> {
        if config.data_dir.is_empty() {
            return Ok(Self::in_memory(&config.txn_id_prefix));
        }
        Self::open_dir(
            Path::new(&config.data_dir),
            &config.txn_id_prefix,
            SyncMode::parse(&config.sync_mode)?,
        )
    }

    pub fn open_dir(dir: &Path, txn_id_prefix: &str, sync_mode: SyncMode) -> Result<Self, StorageError> {
        let path = dir.join(INTENT_WAL_FILENAME);
        let mut entries: Vec<IntentEntry> = Vec::new();
        let mut last_epoch = 0;
        for record in read_records::<IntentRecord>(&path)? {
            match record {
                IntentRecord::Epoch { epoch } => last_epoch = last_epoch.max(epoch),
                IntentRecord::Append { entries: appended } => entries.extend(appended),
                IntentRecord::Reset { retained } => entries = retained,
            }
        }

        let epoch = last_epoch + 1;
        let mut wal = WalWriter::open(&path, sync_mode)?;
        let mut compacted = vec![IntentRecord::Epoch { epoch }];
        if !entries.is_empty() {
            compacted.push(IntentRecord::Append { entries: entries.clone() });
        }
        wal.rewrite(&compacted)?;

        tracing::info!(
            epoch,
            pending_entries = entries.len(),
            "intent log opened from {}",
            path.display()
        );

        Ok(Self {
            table: Mutex::new(IntentTable {
                entries,
                epoch,
                next_seq: 1,
                wal: Some(wal),
                commits: 0,
                poisoned: false,
            }),
            txn_id_prefix: txn_id_prefix.to_string(),
            path: Some(path),
            fail_next_write: AtomicBool::new(false),
        })
    }

    /// `BEGIN; LOCK TABLE`. Blocks until no other transaction holds the table.
    pub fn begin(&self) -> IntentLogTxn<'_> {
        IntentLogTxn {
            table: self.table.lock(),
            txn_id_prefix: &self.txn_id_prefix,
            pending: Vec::new(),
            reset: None,
            fail_next_write: &self.fail_next_write,
        }
    }

    /// Make the next record write fail. A durable log fails it after the
    /// frame has reached the file, like a lost fsync. Does not take the lock.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Committed entries (takes the table lock).
    pub fn entries(&self) -> Vec<IntentEntry> {
        self.table.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch(&self) -> u64 {
        self.table.lock().epoch
    }

    /// Coordinator transactions committed since open.
    pub fn commits(&self) -> u64 {
        self.table.lock().commits
    }

    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    /// Records currently in the backing file (durable logs only).
    pub fn durable_records(&self) -> Result<Vec<IntentRecord>, StorageError> {
        match &self.path {
            Some(path) => {
                let _table = self.table.lock();
                read_records(path)
            }
            None => Ok(Vec::new()),
        }
    }
}

/// Open coordinator-local transaction holding the intent log table lock.
pub struct IntentLogTxn<'a> {
    table: MutexGuard<'a, IntentTable>,
    txn_id_prefix: &'a str,
    pending: Vec<IntentEntry>,
    reset: Option<Vec<IntentEntry>>,
    fail_next_write: &'a AtomicBool,
}

impl<'a> IntentLogTxn<'a> {
    /// Allocate the next global transaction id of the current epoch.
    pub fn next_txn_id(&mut self) -> GlobalTxnId {
        let seq = self.table.next_seq;
        self.table.next_seq += 1;
        GlobalTxnId::new(self.txn_id_prefix, self.table.epoch, seq)
    }

    /// Committed entries as of `begin()`.
    pub fn entries(&self) -> &[IntentEntry] {
        &self.table.entries
    }

    /// True after a failed write until a checkpoint succeeds.
    pub fn is_poisoned(&self) -> bool {
        self.table.poisoned
    }

    /// Entries staged in this transaction.
    pub fn pending(&self) -> &[IntentEntry] {
        &self.pending
    }

    /// `INSERT INTO transactions_to_commit VALUES (txn_id, shard_id)`, uncommitted.
    pub fn append(&mut self, entry: IntentEntry) -> Result<(), StorageError> {
        let visible = self.reset.as_ref().unwrap_or(&self.table.entries);
        if visible.contains(&entry) || self.pending.contains(&entry) {
            return Err(StorageError::DuplicateTransaction(entry.txn_id));
        }
        self.pending.push(entry);
        Ok(())
    }

    /// Replace the table contents with `retained` at commit
    /// (`TRUNCATE` when `retained` is empty).
    pub fn reset(&mut self, retained: Vec<IntentEntry>) {
        self.reset = Some(retained);
    }

    /// Write all staged changes as one durable record and keep the lock.
    /// Returns the number of committed entries. On error the staged
    /// changes are dropped, the table is unchanged and poisoned.
    pub fn checkpoint(&mut self) -> Result<usize, StorageError> {
        let poisoned = self.table.poisoned;
        let record = match self.reset.take() {
            Some(retained)
                if !poisoned && self.pending.is_empty() && retained == self.table.entries =>
            {
                return Ok(retained.len());
            }
            Some(mut retained) => {
                retained.append(&mut self.pending);
                IntentRecord::Reset { retained }
            }
            None if !poisoned && self.pending.is_empty() => return Ok(self.table.entries.len()),
            None if poisoned => {
                let mut retained = self.table.entries.clone();
                retained.append(&mut self.pending);
                IntentRecord::Reset { retained }
            }
            None => IntentRecord::Append { entries: std::mem::take(&mut self.pending) },
        };

        let fail = self.fail_next_write.swap(false, Ordering::SeqCst);
        let table = &mut *self.table;
        let written = match table.wal.as_mut() {
            Some(wal) => {
                if fail {
                    wal.fail_next_sync();
                }
                wal.append(&record)
            }
            None if fail => Err(StorageError::Wal("injected write failure".into())),
            None => Ok(()),
        };
        if let Err(e) = written {
            table.poisoned = true;
            return Err(e);
        }
        if table.poisoned {
            tracing::info!(entries = table.entries.len(), "intent log settled after failed write");
            table.poisoned = false;
        }
        match record {
            IntentRecord::Reset { retained } => table.entries = retained,
            IntentRecord::Append { entries } => table.entries.extend(entries),
            IntentRecord::Epoch { .. } => {}
        }
        table.commits += 1;
        Ok(table.entries.len())
    }

    /// `COMMIT`: `checkpoint`, then release the table lock.
    pub fn commit(mut self) -> Result<usize, StorageError> {
        self.checkpoint()
    }

    /// Drop staged changes and keep the lock.
    pub fn discard(&mut self) {
        if !self.pending.is_empty() || self.reset.is_some() {
            tracing::debug!(discarded = self.pending.len(), "intent log changes discarded");
        }
        self.pending.clear();
        self.reset = None;
    }

    /// `ROLLBACK`: discard staged changes and release the table lock.
    pub fn rollback(mut self) {
        self.discard();
    }
}
