//! # in_memory
//!
//! why: a log for tests and for members that keep no history on disk
//! relations: implements raft_core::RaftLog; sized from RaftLogConfig
//! what: InMemoryRaftLog, a fixed-capacity ring that drops its oldest entries

use parking_lot::RwLock;
use raft_core::log::{check_monotonic_terms, cursor_start_error};
use raft_core::{
    EntryCursor, LogEntry, LogIndex, RaftError, RaftLog, RaftLogConfig, ReadableRaftLog, Result,
    Term, NO_INDEX,
};
use std::sync::Arc;

struct Ring {
    slots: Vec<Option<LogEntry>>,
    prev_index: LogIndex,
    prev_term: Term,
    append_index: LogIndex,
}

impl Ring {
    fn slot(&self, index: LogIndex) -> usize {
        index.rem_euclid(self.slots.len() as LogIndex) as usize
    }

    fn entry(&self, index: LogIndex) -> Result<&LogEntry> {
        if index <= self.prev_index || index > self.append_index {
            return Err(self.not_found(index));
        }
        self.slots[self.slot(index)]
            .as_ref()
            .ok_or_else(|| self.not_found(index))
    }

    fn term(&self, index: LogIndex) -> Result<Term> {
        if index == self.prev_index {
            return Ok(self.prev_term);
        }
        Ok(self.entry(index)?.term)
    }

    fn last_term(&self) -> Term {
        self.term(self.append_index).unwrap_or(self.prev_term)
    }

    fn not_found(&self, index: LogIndex) -> RaftError {
        RaftError::index_not_found(index, self.prev_index, self.append_index)
    }

    /// drop `(prev_index, new_prev]`, remembering the term at new_prev
    fn drop_prefix(&mut self, new_prev: LogIndex) {
        let new_prev_term = self.term(new_prev).unwrap_or(self.prev_term);
        for index in self.prev_index + 1..=new_prev {
            let slot = self.slot(index);
            self.slots[slot] = None;
        }
        self.prev_index = new_prev;
        self.prev_term = new_prev_term;
    }
}

/// Bounded log holding at most `capacity` entries above prev_index.
///
/// Appending past capacity prunes the oldest entries. Nothing survives a
/// restart.
pub struct InMemoryRaftLog {
    ring: Arc<RwLock<Ring>>,
}

impl InMemoryRaftLog {
    /// capacity is clamped to at least one entry
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Arc::new(RwLock::new(Ring {
                slots: vec![None; capacity.max(1)],
                prev_index: NO_INDEX,
                prev_term: 0,
                append_index: NO_INDEX,
            })),
        }
    }

    pub fn from_config(config: &RaftLogConfig) -> Self {
        Self::new(config.in_memory_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().slots.len()
    }
}

impl ReadableRaftLog for InMemoryRaftLog {
    fn append_index(&self) -> LogIndex {
        self.ring.read().append_index
    }

    fn prev_index(&self) -> LogIndex {
        self.ring.read().prev_index
    }

    fn prev_term(&self) -> Term {
        self.ring.read().prev_term
    }

    fn read_entry_term(&self, index: LogIndex) -> Result<Term> {
        self.ring.read().term(index)
    }

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry> {
        self.ring.read().entry(index).cloned()
    }

    fn get_entry_cursor(&self, from_index: LogIndex) -> EntryCursor<'_> {
        let (prev_index, end) = {
            let ring = self.ring.read();
            (ring.prev_index, ring.append_index)
        };
        if let Some(err) = cursor_start_error(from_index, prev_index, end) {
            return Box::new(std::iter::once(Err(err)));
        }
        let ring = Arc::clone(&self.ring);
        Box::new((from_index..=end).map(move |index| {
            ring.read().entry(index).cloned().map(|entry| (index, entry))
        }))
    }
}

impl RaftLog for InMemoryRaftLog {
    fn append(&self, entries: &[LogEntry]) -> Result<LogIndex> {
        let mut ring = self.ring.write();
        check_monotonic_terms(ring.last_term(), entries)?;
        let capacity = ring.slots.len() as LogIndex;
        for entry in entries {
            let index = ring.append_index + 1;
            if index - ring.prev_index > capacity {
                ring.drop_prefix(index - capacity);
            }
            let slot = ring.slot(index);
            ring.slots[slot] = Some(entry.clone());
            ring.append_index = index;
        }
        Ok(ring.append_index)
    }

    fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut ring = self.ring.write();
        if from_index <= ring.prev_index {
            return Err(ring.not_found(from_index));
        }
        for index in from_index..=ring.append_index {
            let slot = ring.slot(index);
            ring.slots[slot] = None;
        }
        if from_index <= ring.append_index {
            ring.append_index = from_index - 1;
        }
        Ok(())
    }

    fn skip(&self, index: LogIndex, term: Term) -> Result<LogIndex> {
        let mut ring = self.ring.write();
        if index > ring.append_index {
            ring.slots.iter_mut().for_each(|slot| *slot = None);
            ring.prev_index = index;
            ring.prev_term = term;
            ring.append_index = index;
        }
        Ok(ring.append_index)
    }

    fn prune(&self, safe_index: LogIndex) -> Result<LogIndex> {
        let mut ring = self.ring.write();
        let new_prev = safe_index.min(ring.append_index);
        if new_prev > ring.prev_index {
            ring.drop_prefix(new_prev);
        }
        Ok(ring.prev_index)
    }
}
