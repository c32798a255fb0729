//! # reconcile
//!
//! why: keep a follower log consistent with the leader's without redundant writes
//! relations: called by node.rs for every AppendEntries, works on any RaftLog
//! what: reconcile(), AppendOutcome, RejectReason

use crate::error::{RaftError, Result};
use crate::log::{LogIndex, RaftLog, Term};
use crate::message::AppendEntriesRequest;
use tracing::{debug, info};

/// Why a batch was refused; a normal answer for the leader, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// the leader assumes entries this log does not have yet
    LogTooShort { append_index: LogIndex },
    /// no common prefix at prev_log_index
    ConflictingTerm {
        index: LogIndex,
        expected: Term,
        actual: Term,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted {
        /// last index known to equal the leader's log
        match_index: LogIndex,
        /// where the local suffix was cut, if anywhere
        truncated_from: Option<LogIndex>,
        /// entries actually written
        appended: usize,
    },
    Rejected(RejectReason),
}

impl AppendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AppendOutcome::Accepted { .. })
    }
}

/// Apply a leader's batch to `log`.
///
/// Matching entries are skipped; at the first conflict the local suffix is
/// truncated and the rest of the batch appended. A batch that fully matches
/// never shortens the log. Entries at or below `commit_index` may never be
/// truncated.
pub fn reconcile<L: RaftLog + ?Sized>(
    log: &L,
    request: &AppendEntriesRequest,
    commit_index: LogIndex,
) -> Result<AppendOutcome> {
    let append_index = log.append_index();
    if request.prev_log_index > append_index {
        debug!(
            prev_log_index = request.prev_log_index,
            append_index, "rejecting append, log too short"
        );
        return Ok(AppendOutcome::Rejected(RejectReason::LogTooShort { append_index }));
    }

    // at or below prev_index the prefix is compacted and known to match
    if request.prev_log_index > log.prev_index() {
        let local_term = log.read_entry_term(request.prev_log_index)?;
        if local_term != request.prev_log_term {
            debug!(
                index = request.prev_log_index,
                expected = request.prev_log_term,
                actual = local_term,
                "rejecting append, conflicting term"
            );
            return Ok(AppendOutcome::Rejected(RejectReason::ConflictingTerm {
                index: request.prev_log_index,
                expected: request.prev_log_term,
                actual: local_term,
            }));
        }
    }

    let mut truncated_from = None;
    let mut appended = 0;
    for (offset, entry) in request.entries.iter().enumerate() {
        let index = request.prev_log_index + 1 + offset as LogIndex;
        if index <= log.prev_index() {
            continue;
        }
        if index <= log.append_index() {
            if log.read_entry_term(index)? == entry.term {
                continue;
            }
            if index <= commit_index {
                return Err(RaftError::TruncateCommitted {
                    from_index: index,
                    commit_index,
                });
            }
            info!(from_index = index, "truncating conflicting suffix");
            log.truncate(index)?;
            truncated_from = Some(index);
        }
        let rest = &request.entries[offset..];
        log.append(rest)?;
        appended = rest.len();
        break;
    }

    Ok(AppendOutcome::Accepted {
        match_index: request.last_index(),
        truncated_from,
        appended,
    })
}
