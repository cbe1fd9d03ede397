use thiserror::Error;

use crate::types::{Amount, GlobalTxnId, ShardId};

/// Convenience alias for `Result<T, BankError>`.
pub type BankResult<T> = Result<T, BankError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: bad input, unknown account, insufficient funds
/// - `Retryable`: transport loss or row-lock contention; caller SHOULD retry
/// - `Transient`: local durability or recovery backlog; caller MAY retry after back-off
/// - `InternalBug`: should never happen, atomicity may be at risk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error returned by the coordinator, the sweeper and the bank facade.
#[derive(Error, Debug)]
pub enum BankError {
    /// A shard rejected or could not durably stage a branch.
    #[error("Prepare failed for {txn_id} on {shard}: {source}")]
    PrepareFailure {
        txn_id: GlobalTxnId,
        shard: ShardId,
        #[source]
        source: StorageError,
    },

    /// Coordinator-local durability failure while recording or clearing intents.
    #[error("Intent log write failed ({context}): {source}")]
    LogWriteFailure {
        context: String,
        #[source]
        source: StorageError,
    },

    /// A logged branch could not be committed because the shard does not hold it.
    #[error("Recovery inconsistency for {txn_id} on {shard}: {detail}")]
    RecoveryInconsistency {
        txn_id: GlobalTxnId,
        shard: ShardId,
        detail: String,
    },

    /// Recovery gave up on a reachable shard after retrying.
    #[error("Recovery halted on {shard} after {attempts} attempts: {source}")]
    RecoveryExhausted {
        shard: ShardId,
        attempts: u32,
        #[source]
        source: StorageError,
    },

    /// Non-transactional statement (account insert, balance read) failed.
    #[error("Storage error on {shard}: {source}")]
    Storage {
        shard: ShardId,
        #[source]
        source: StorageError,
    },

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Simulated coordinator crash (fault injection only).
    #[error("Injected coordinator crash at {0}")]
    InjectedCrash(&'static str),

    /// Internal bug, should never occur in production.
    #[error("InternalBug [{error_code}]: {message} | context: {debug_context}")]
    InternalBug {
        error_code: &'static str,
        message: String,
        debug_context: String,
    },
}

/// Errors raised by a shard store or by the coordinator store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Insufficient funds in {account}: balance {balance}, change {delta}")]
    InsufficientFunds {
        account: String,
        balance: Amount,
        delta: Amount,
    },

    #[error("Balance overflow on {0}")]
    BalanceOverflow(String),

    #[error("Transaction identifier {0} already in use")]
    DuplicateTransaction(GlobalTxnId),

    #[error("Statement is not a mutation: {0}")]
    NotMutating(String),

    #[error("Lock wait timeout on row {0}")]
    LockTimeout(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::AccountNotFound(_)
            | StorageError::AccountExists(_)
            | StorageError::InsufficientFunds { .. }
            | StorageError::BalanceOverflow(_)
            | StorageError::NotMutating(_) => ErrorKind::UserError,

            StorageError::Unavailable(_) | StorageError::LockTimeout(_) => ErrorKind::Retryable,

            StorageError::Io(_) | StorageError::Wal(_) => ErrorKind::Transient,

            StorageError::DuplicateTransaction(_) | StorageError::Serialization(_) => {
                ErrorKind::InternalBug
            }
        }
    }

    /// True for errors a caller may retry against the same store.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::Transient)
    }
}

impl BankError {
    pub fn internal_bug(
        error_code: &'static str,
        message: impl Into<String>,
        debug_context: impl Into<String>,
    ) -> Self {
        BankError::InternalBug {
            error_code,
            message: message.into(),
            debug_context: debug_context.into(),
        }
    }

    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BankError::PrepareFailure { source, .. } => source.kind(),
            BankError::Storage { source, .. } => source.kind(),
            BankError::LogWriteFailure { .. } => ErrorKind::Transient,
            BankError::RecoveryExhausted { .. } => ErrorKind::Transient,
            BankError::InjectedCrash(_) => ErrorKind::Transient,
            BankError::InvalidTransfer(_) | BankError::Config(_) => ErrorKind::UserError,
            BankError::RecoveryInconsistency { .. } | BankError::InternalBug { .. } => {
                ErrorKind::InternalBug
            }
        }
    }

    /// Returns true if the client should retry this operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if the client may retry after back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is a user/input error (4xx equivalent).
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Short machine-readable label, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BankError::PrepareFailure { .. } => "prepare_failure",
            BankError::LogWriteFailure { .. } => "log_write_failure",
            BankError::RecoveryInconsistency { .. } => "recovery_inconsistency",
            BankError::RecoveryExhausted { .. } => "recovery_exhausted",
            BankError::Storage { .. } => "storage",
            BankError::InvalidTransfer(_) => "invalid_transfer",
            BankError::Config(_) => "config",
            BankError::InjectedCrash(_) => "injected_crash",
            BankError::InternalBug { .. } => "internal_bug",
        }
    }
}
