//! Identifiers, error taxonomy and configuration shared by every shardbank crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::BankConfig;
pub use error::{BankError, BankResult, ErrorKind, StorageError};
pub use types::{Amount, GlobalTxnId, ShardId};
