//! # log
//!
//! why: define the append-only, prunable log every higher layer talks to
//! relations: implemented by raft-storage backends, driven by node.rs, read by apply.rs
//! what: LogIndex/Term, LogEntry, ReadableRaftLog + RaftLog traits, EntryCursor

use crate::content::ReplicatedContent;
use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};

/// Absolute position in the log; -1 sits before the first entry
pub type LogIndex = i64;

pub type Term = u64;

/// Index of an empty log before anything was appended or skipped
pub const NO_INDEX: LogIndex = -1;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term of the leader that created this entry
    pub term: Term,
    /// The command to be handed to the state machines once committed
    pub content: ReplicatedContent,
}

impl LogEntry {
    pub fn new(term: Term, content: ReplicatedContent) -> Self {
        Self { term, content }
    }
}

/// Lazy sequence of `(index, entry)` pairs produced by `get_entry_cursor`
pub type EntryCursor<'a> = Box<dyn Iterator<Item = Result<(LogIndex, LogEntry)>> + Send + 'a>;

/// read side of a log; safe to call while the writer is appending
pub trait ReadableRaftLog: Send + Sync {
    /// highest index present, or prev_index when no entries are stored
    fn append_index(&self) -> LogIndex;

    /// boundary at or below which entries are gone
    fn prev_index(&self) -> LogIndex;

    /// term of the entry at prev_index, zero when not known
    fn prev_term(&self) -> Term;

    /// term at `index`; prev_index answers with prev_term
    fn read_entry_term(&self, index: LogIndex) -> Result<Term>;

    fn read_entry(&self, index: LogIndex) -> Result<LogEntry>;

    /// entries from `from_index` up to the append index seen right now
    fn get_entry_cursor(&self, from_index: LogIndex) -> EntryCursor<'_>;
}

/// write side; calls are serialized by the single owner of the log
pub trait RaftLog: ReadableRaftLog {
    /// append contiguously after append_index, returns the new append index
    fn append(&self, entries: &[LogEntry]) -> Result<LogIndex>;

    /// drop every entry at or above `from_index`
    fn truncate(&self, from_index: LogIndex) -> Result<()>;

    /// jump an empty log forward to `index`, returns the append index
    fn skip(&self, index: LogIndex, term: Term) -> Result<LogIndex>;

    /// drop a prefix ending no later than `safe_index`, returns the new prev index
    fn prune(&self, safe_index: LogIndex) -> Result<LogIndex>;
}

/// reject a batch whose terms go backwards, starting from `last_term`
pub fn check_monotonic_terms(last_term: Term, entries: &[LogEntry]) -> Result<()> {
    let mut previous = last_term;
    for entry in entries {
        if entry.term < previous {
            return Err(RaftError::NonMonotonicTerm {
                term: entry.term,
                previous,
            });
        }
        previous = entry.term;
    }
    Ok(())
}

/// the first item a cursor yields when it starts below the retained range
pub fn cursor_start_error(
    from_index: LogIndex,
    prev_index: LogIndex,
    append_index: LogIndex,
) -> Option<RaftError> {
    (from_index <= prev_index).then(|| RaftError::index_not_found(from_index, prev_index, append_index))
}
