//! # watermark
//!
//! why: publish monotonically rising positions to readers without taking locks
//! relations: commit index in node.rs, applied index in apply.rs, id watermarks
//! what: HighestValueCell (compare-and-set loop), IndexWatermark for log indices

use crate::log::{LogIndex, NO_INDEX};
use std::sync::atomic::{AtomicU64, Ordering};

/// Holds the highest value ever offered.
///
/// A losing offer (lower or equal to the current value) is dropped and reported
/// as `false`; the offerer is not expected to retry.
#[derive(Debug, Default)]
pub struct HighestValueCell {
    value: AtomicU64,
}

impl HighestValueCell {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// raise the cell to `candidate` if it is higher, returns whether it won
    pub fn offer(&self, candidate: u64) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if candidate <= current {
                return false;
            }
            match self.value.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// A HighestValueCell over log indices, starting at -1
#[derive(Debug)]
pub struct IndexWatermark {
    // stores index + 1 so that -1 fits an unsigned cell
    cell: HighestValueCell,
}

impl IndexWatermark {
    pub fn new(initial: LogIndex) -> Self {
        Self {
            cell: HighestValueCell::new(Self::encode(initial)),
        }
    }

    pub fn get(&self) -> LogIndex {
        self.cell.get() as LogIndex - 1
    }

    pub fn offer(&self, index: LogIndex) -> bool {
        self.cell.offer(Self::encode(index))
    }

    fn encode(index: LogIndex) -> u64 {
        (index.max(NO_INDEX) + 1) as u64
    }
}

impl Default for IndexWatermark {
    fn default() -> Self {
        Self::new(NO_INDEX)
    }
}
