//! # message
//!
//! why: define the logical rpc fields the follower log reacts to
//! relations: handled by node.rs, framed by marshal.rs, carried by an external transport
//! what: AppendEntriesRequest/Response, Heartbeat, PruneRequest, RaftMessage

use crate::log::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub leader_term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// index the last carried entry lands on
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Answer to AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// highest index known to match the leader, -1 on reject
    pub match_index: LogIndex,
    /// follower's append index after handling the request
    pub append_index: LogIndex,
}

/// Commit notification without entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub leader_term: Term,
    pub commit_index: LogIndex,
    pub commit_index_term: Term,
}

/// Local request to compact the log up to an applied index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneRequest {
    pub prune_index: LogIndex,
}

/// All messages the follower log understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    Heartbeat(Heartbeat),
    Prune(PruneRequest),
}
