//! # raft-core
//!
//! why: the replicated log and everything that consumes it, independent of disk layout
//! relations: raft-storage implements the log traits and stores defined here
//! what: log traits, content marshaling, append reconciliation, state machines, id allocation

pub mod apply;
pub mod config;
pub mod content;
pub mod error;
pub mod id_alloc;
pub mod log;
pub mod marshal;
pub mod message;
pub mod node;
pub mod reconcile;
pub mod state_machine;
pub mod watermark;
pub mod work_sync;

pub use apply::CommitApplier;
pub use config::{IdAllocationConfig, RaftLogConfig, ReplicationConfig};
pub use content::{ContentKind, MemberId, MemberSet, ReplicatedContent, ReplicatedIdAllocationRequest};
pub use error::{RaftError, Result};
pub use log::{EntryCursor, LogEntry, LogIndex, RaftLog, ReadableRaftLog, Term, NO_INDEX};
pub use marshal::Marshal;
pub use message::{AppendEntriesRequest, AppendEntriesResponse, Heartbeat, PruneRequest, RaftMessage};
pub use node::{RaftNode, TermStore};
pub use reconcile::{reconcile, AppendOutcome, RejectReason};
pub use state_machine::{StateMachine, StateMachineRegistry, TransactionCommitProcess};
