//! # error
//!
//! why: one error vocabulary for the log, its backends and the state machines
//! relations: returned by every fallible operation in raft-core and raft-storage
//! what: RaftError, Result alias, durability helper

use crate::LogIndex;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Error, Debug)]
pub enum RaftError {
    /// the index is at or below prev_index, or beyond append_index
    #[error("index {index} not found (prev index {prev_index}, append index {append_index})")]
    IndexNotFound {
        index: LogIndex,
        prev_index: LogIndex,
        append_index: LogIndex,
    },

    /// a record could not be decoded; torn tails are repaired before this escapes
    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("unknown content type tag {0}")]
    UnknownContentType(u8),

    #[error("unknown id type tag {0}")]
    UnknownIdType(u32),

    #[error("entry term {term} is lower than preceding term {previous}")]
    NonMonotonicTerm { term: u64, previous: u64 },

    #[error("refusing to truncate at {from_index}, entries up to {commit_index} are committed")]
    TruncateCommitted {
        from_index: LogIndex,
        commit_index: LogIndex,
    },

    /// a write or flush failed; the owner must stop acting on this log or machine
    #[error("durability failure: {0}")]
    Durability(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("could not acquire an id range for {id_type} after {attempts} attempts")]
    AllocationFailed { id_type: String, attempts: u32 },

    #[error("state machine applier stopped after an earlier failure at index {index}")]
    ApplierFailed { index: LogIndex },

    #[error("combined work apply failed: {0}")]
    WorkApplyFailed(String),
}

impl RaftError {
    pub fn durability(err: io::Error) -> Self {
        RaftError::Durability(err)
    }

    pub fn index_not_found(index: LogIndex, prev_index: LogIndex, append_index: LogIndex) -> Self {
        RaftError::IndexNotFound {
            index,
            prev_index,
            append_index,
        }
    }

    /// true for errors that must take the owning role down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::Durability(_) | RaftError::ApplierFailed { .. } | RaftError::TruncateCommitted { .. }
        )
    }
}
