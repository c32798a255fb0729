//! # content
//!
//! why: name the kinds of commands that travel through the replicated log
//! relations: stored in LogEntry, encoded by marshal.rs, routed by state_machine.rs
//! what: MemberId, MemberSet, ReplicatedIdAllocationRequest, ReplicatedContent

use crate::id_alloc::{IdRange, IdType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Identity of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form is enough to tell members apart in logs
        let s = self.0.to_string();
        write!(f, "MemberId{{{}}}", &s[..8])
    }
}

/// The voting members of the cluster as recorded in the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet {
    members: BTreeSet<MemberId>,
}

impl MemberSet {
    pub fn new(members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberId> {
        self.members.iter()
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A proposal to claim `[range_start, range_start + range_length)` of an id type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedIdAllocationRequest {
    pub owner: MemberId,
    pub id_type: IdType,
    pub range_start: u64,
    pub range_length: u64,
}

impl ReplicatedIdAllocationRequest {
    pub fn new(owner: MemberId, id_type: IdType, range_start: u64, range_length: u64) -> Self {
        Self {
            owner,
            id_type,
            range_start,
            range_length,
        }
    }

    pub fn range(&self) -> IdRange {
        IdRange::new(self.range_start, self.range_length)
    }
}

/// Every command kind the log can carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedContent {
    /// written by a new leader so it can commit entries from earlier terms
    NewLeaderBarrier,
    MemberSet(MemberSet),
    IdAllocation(ReplicatedIdAllocationRequest),
    /// opaque transaction produced by the storage engine
    Transaction(Vec<u8>),
}

impl ReplicatedContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            ReplicatedContent::NewLeaderBarrier => ContentKind::NewLeaderBarrier,
            ReplicatedContent::MemberSet(_) => ContentKind::MemberSet,
            ReplicatedContent::IdAllocation(_) => ContentKind::IdAllocation,
            ReplicatedContent::Transaction(_) => ContentKind::Transaction,
        }
    }
}

/// Wire tag of each content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentKind {
    NewLeaderBarrier = 0,
    MemberSet = 1,
    IdAllocation = 2,
    Transaction = 3,
}

impl TryFrom<u8> for ContentKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NewLeaderBarrier),
            1 => Ok(Self::MemberSet),
            2 => Ok(Self::IdAllocation),
            3 => Ok(Self::Transaction),
            other => Err(other),
        }
    }
}
