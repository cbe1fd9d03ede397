use serde::{Deserialize, Serialize};
use std::fmt;

/// Account balance in minor currency units.
pub type Amount = i64;

/// Positional identifier for a shard (`0..N-1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard:{}", self.0)
    }
}

/// Globally unique identifier of a cross-shard transaction.
///
/// Rendered as `<prefix>_<epoch>_<seq>`. The same id names every branch
/// of the transaction on every participating shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTxnId(pub String);

impl GlobalTxnId {
    pub fn new(prefix: &str, epoch: u64, seq: u64) -> Self {
        Self(format!("{}_{}_{}", prefix, epoch, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GlobalTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GlobalTxnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
