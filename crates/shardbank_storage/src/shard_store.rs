//! Interface every shard store exposes to the coordinator and the sweeper.
//!
//! A shard store is a transactional store with PostgreSQL-style prepared
//! transactions: a branch is staged durably under a global id with
//! `PREPARE TRANSACTION`, survives a crash detached from any session, and is
//! finalized later by `COMMIT PREPARED` or `ROLLBACK PREPARED`.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use shardbank_common::error::StorageError;
use shardbank_common::types::{Amount, GlobalTxnId, ShardId};

/// Statements understood by a shard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    InsertAccount { name: String, balance: Amount },
    AdjustBalance { name: String, delta: Amount },
    SelectBalance { name: String },
    SumBalances,
}

impl Statement {
    pub fn credit(name: &str, amount: Amount) -> Self {
        Statement::AdjustBalance { name: name.to_string(), delta: amount }
    }

    /// Fails for `Amount::MIN`, whose negation does not fit.
    pub fn debit(name: &str, amount: Amount) -> Result<Self, StorageError> {
        let delta = amount
            .checked_neg()
            .ok_or_else(|| StorageError::BalanceOverflow(name.to_string()))?;
        Ok(Statement::AdjustBalance { name: name.to_string(), delta })
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Statement::InsertAccount { .. } | Statement::AdjustBalance { .. })
    }

    /// Row key this statement locks, if any.
    pub fn row_key(&self) -> Option<&str> {
        match self {
            Statement::InsertAccount { name, .. }
            | Statement::AdjustBalance { name, .. }
            | Statement::SelectBalance { name } => Some(name),
            Statement::SumBalances => None,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::InsertAccount { name, balance } => write!(
                f,
                "INSERT INTO accounts (name, balance) VALUES ('{}', {})",
                name, balance
            ),
            Statement::AdjustBalance { name, delta } if *delta < 0 => write!(
                f,
                "UPDATE accounts SET balance = balance - {} WHERE name = '{}'",
                delta.unsigned_abs(),
                name
            ),
            Statement::AdjustBalance { name, delta } => write!(
                f,
                "UPDATE accounts SET balance = balance + {} WHERE name = '{}'",
                delta, name
            ),
            Statement::SelectBalance { name } => {
                write!(f, "SELECT balance FROM accounts WHERE name = '{}'", name)
            }
            Statement::SumBalances => write!(f, "SELECT COALESCE(SUM(balance), 0) FROM accounts"),
        }
    }
}

/// Result of an autocommit statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// Rows affected by a mutation.
    Affected(u64),
    /// Single scalar value (balance or sum).
    Scalar(Amount),
}

impl QueryResult {
    pub fn scalar(&self) -> Option<Amount> {
        match self {
            QueryResult::Scalar(v) => Some(*v),
            QueryResult::Affected(_) => None,
        }
    }
}

/// Answer to `COMMIT PREPARED` / `ROLLBACK PREPARED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The prepared transaction was found and finalized by this call.
    Applied,
    /// Already committed by an earlier call.
    AlreadyCommitted,
    /// Already rolled back by an earlier call.
    AlreadyRolledBack,
    /// The store has never prepared this id.
    Unknown,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Applied => write!(f, "applied"),
            Resolution::AlreadyCommitted => write!(f, "already_committed"),
            Resolution::AlreadyRolledBack => write!(f, "already_rolled_back"),
            Resolution::Unknown => write!(f, "unknown"),
        }
    }
}

/// A shard's transactional store. Calls are blocking.
pub trait ShardStore: Send + Sync {
    fn shard_id(&self) -> ShardId;

    /// Run one statement in its own (autocommit) transaction.
    fn execute(&self, stmt: &Statement) -> Result<QueryResult, StorageError>;

    /// `BEGIN; <stmts>; PREPARE TRANSACTION <gid>`.
    ///
    /// On success the effects are durably staged and invisible to readers;
    /// on error nothing is staged.
    fn prepare_transaction(&self, gid: &GlobalTxnId, stmts: &[Statement]) -> Result<(), StorageError>;

    /// `COMMIT PREPARED <gid>`. Repeating it is harmless.
    fn commit_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError>;

    /// `ROLLBACK PREPARED <gid>`. Repeating it is harmless.
    fn rollback_prepared(&self, gid: &GlobalTxnId) -> Result<Resolution, StorageError>;

    /// Ids currently prepared but not yet committed or rolled back.
    fn list_prepared(&self) -> Result<Vec<GlobalTxnId>, StorageError>;

    /// Drop remembered outcomes of resolved ids not in `keep`. Called once
    /// the coordinator no longer references them; a store may keep a bounded
    /// history. Returns the number of outcomes forgotten.
    fn forget_outcomes(&self, keep: &HashSet<GlobalTxnId>) -> Result<usize, StorageError>;
}
