//! Listener checkpoints: the `(block, transactionIndex, logIndex)` position
//! of the last event confirmed as delivered.
//!
//! Checkpoints are totally ordered lexicographically, so the derived `Ord`
//! on the field order below is the stream ordering. Callers persist the
//! serialized value themselves and hand it back on restart.

use serde::{Deserialize, Serialize};

/// A listener's resume point / high-water mark.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Block number of the last delivered event.
    pub block: i64,
    /// Transaction index within that block.
    pub transaction_index: i64,
    /// Log index within that block.
    pub log_index: i64,
}

impl Checkpoint {
    pub fn new(block: i64, transaction_index: i64, log_index: i64) -> Self {
        Self {
            block,
            transaction_index,
            log_index,
        }
    }

    /// The empty checkpoint, used as a deserialization target by callers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A checkpoint ordered before every log of `block`, so that block is
    /// delivered in full.
    pub fn before_block(block: i64) -> Self {
        Self::new(block, -1, -1)
    }

    /// Returns `true` if an event at `position` has not yet been delivered
    /// relative to this checkpoint.
    pub fn is_before(&self, position: &Checkpoint) -> bool {
        self < position
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.block, self.transaction_index, self.log_index
        )
    }
}
