//! # id_alloc
//!
//! why: hand out cluster-unique id ranges by agreeing on them through the log
//! relations: requests travel as content.rs values, applied via state_machine.rs
//! what: IdType, IdRange, IdAllocationState, store trait, handoff slot, watermarks

mod generator;
mod machine;
mod updates;

pub use generator::{Replicator, ReplicatedIdGenerator, ReplicatedIdRangeAcquirer};
pub use machine::ReplicatedIdAllocationStateMachine;
pub use updates::{IdGeneratorUpdates, IdGeneratorWorkSyncs, IdMark, IdMarkTarget};

use crate::error::{RaftError, Result};
use crate::log::{LogIndex, NO_INDEX};
use crate::watermark::HighestValueCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kinds of ids the storage engine draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IdType {
    Node = 0,
    Relationship = 1,
    Property = 2,
    StringBlock = 3,
    ArrayBlock = 4,
    PropertyKeyToken = 5,
    PropertyKeyTokenName = 6,
    RelationshipTypeToken = 7,
    RelationshipTypeTokenName = 8,
    LabelToken = 9,
    LabelTokenName = 10,
    NeoStoreBlock = 11,
    Schema = 12,
    NodeLabels = 13,
    RelationshipGroup = 14,
}

impl IdType {
    pub const ALL: [IdType; 15] = [
        IdType::Node,
        IdType::Relationship,
        IdType::Property,
        IdType::StringBlock,
        IdType::ArrayBlock,
        IdType::PropertyKeyToken,
        IdType::PropertyKeyTokenName,
        IdType::RelationshipTypeToken,
        IdType::RelationshipTypeTokenName,
        IdType::LabelToken,
        IdType::LabelTokenName,
        IdType::NeoStoreBlock,
        IdType::Schema,
        IdType::NodeLabels,
        IdType::RelationshipGroup,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        Self::ALL
            .get(tag as usize)
            .copied()
            .ok_or(RaftError::UnknownIdType(tag))
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Half-open run of ids `[start, start + length)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub length: u64,
}

impl IdRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end()
    }
}

/// Allocation progress for one id type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdTypeState {
    pub first_unallocated: u64,
    /// last range this member won, kept for inspection after restart
    pub owned_range: Option<IdRange>,
}

/// Everything the id allocator persists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocationState {
    types: BTreeMap<IdType, IdTypeState>,
    last_applied: LogIndex,
}

impl Default for IdAllocationState {
    fn default() -> Self {
        Self {
            types: BTreeMap::new(),
            last_applied: NO_INDEX,
        }
    }
}

impl IdAllocationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_state(&self, id_type: IdType) -> IdTypeState {
        self.types.get(&id_type).copied().unwrap_or_default()
    }

    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.type_state(id_type).first_unallocated
    }

    pub fn owned_range(&self, id_type: IdType) -> Option<IdRange> {
        self.type_state(id_type).owned_range
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn set_type_state(&mut self, id_type: IdType, state: IdTypeState) {
        self.types.insert(id_type, state);
    }

    pub fn set_last_applied(&mut self, index: LogIndex) {
        self.last_applied = index;
    }

    /// types that have seen at least one applied request
    pub fn iter(&self) -> impl Iterator<Item = (IdType, IdTypeState)> + '_ {
        self.types.iter().map(|(t, s)| (*t, *s))
    }
}

/// Durable home of IdAllocationState
pub trait IdAllocationStore: Send {
    /// recover the last persisted state, or an empty one
    fn load(&mut self) -> Result<IdAllocationState>;

    /// persist `state` after a change to `changed`; durable on return
    fn persist(&mut self, state: &IdAllocationState, changed: IdType) -> Result<()>;
}

/// Slot per id type through which the allocator hands a freshly won range to
/// the local generator. The machine publishes, the generator takes.
#[derive(Debug, Default)]
pub struct OwnedRangeHandoff {
    slots: Mutex<HashMap<IdType, IdRange>>,
}

impl OwnedRangeHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, id_type: IdType, range: IdRange) {
        self.slots.lock().insert(id_type, range);
    }

    pub fn take(&self, id_type: IdType) -> Option<IdRange> {
        self.slots.lock().remove(&id_type)
    }
}

/// Lock-free view of first_unallocated per id type
#[derive(Debug)]
pub struct IdWatermarks {
    cells: Vec<HighestValueCell>,
}

impl Default for IdWatermarks {
    fn default() -> Self {
        Self {
            cells: IdType::ALL.iter().map(|_| HighestValueCell::default()).collect(),
        }
    }
}

impl IdWatermarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id_type: IdType) -> u64 {
        self.cells[id_type.tag() as usize].get()
    }

    pub fn offer(&self, id_type: IdType, first_unallocated: u64) -> bool {
        self.cells[id_type.tag() as usize].offer(first_unallocated)
    }
}
