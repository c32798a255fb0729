//! # raft-storage
//!
//! why: provide the on-disk and in-memory homes for the replicated log and its side state
//! relations: implements the storage traits defined in raft-core
//! what: InMemoryRaftLog, SegmentedRaftLog, term stores, id allocation stores

pub mod id_store;
pub mod in_memory;
pub mod segmented;
pub mod term;

pub use id_store::{DurableIdAllocationStore, InMemoryIdAllocationStore};
pub use in_memory::InMemoryRaftLog;
pub use segmented::SegmentedRaftLog;
pub use term::{FileTermStore, InMemoryTermStore};
