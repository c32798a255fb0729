//! # id generator
//!
//! why: give the local storage engine ids without a round trip per id
//! relations: proposes requests through a Replicator, consumes the handoff slot
//! what: Replicator trait, ReplicatedIdRangeAcquirer, ReplicatedIdGenerator

use super::{IdRange, IdType, IdWatermarks, OwnedRangeHandoff};
use crate::config::IdAllocationConfig;
use crate::content::{MemberId, ReplicatedContent, ReplicatedIdAllocationRequest};
use crate::error::{RaftError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Gets content committed and applied; provided by the consensus module
pub trait Replicator: Send + Sync {
    /// returns once `content` has been applied to the local state machines
    fn replicate(&self, content: ReplicatedContent) -> Result<()>;
}

/// Wins id ranges for this member, re-requesting after a lost race
pub struct ReplicatedIdRangeAcquirer<R: Replicator> {
    me: MemberId,
    replicator: R,
    handoff: Arc<OwnedRangeHandoff>,
    watermarks: Arc<IdWatermarks>,
    config: IdAllocationConfig,
}

impl<R: Replicator> ReplicatedIdRangeAcquirer<R> {
    pub fn new(
        me: MemberId,
        replicator: R,
        handoff: Arc<OwnedRangeHandoff>,
        watermarks: Arc<IdWatermarks>,
        config: IdAllocationConfig,
    ) -> Self {
        Self {
            me,
            replicator,
            handoff,
            watermarks,
            config,
        }
    }

    pub fn acquire(&self, id_type: IdType) -> Result<IdRange> {
        let attempts = self.config.max_acquire_attempts;
        for attempt in 1..=attempts {
            let start = self.watermarks.get(id_type);
            let request = ReplicatedIdAllocationRequest::new(
                self.me,
                id_type,
                start,
                self.config.default_range_length,
            );
            self.replicator
                .replicate(ReplicatedContent::IdAllocation(request))?;
            if let Some(range) = self.handoff.take(id_type) {
                debug!(%id_type, start = range.start, length = range.length, "acquired id range");
                return Ok(range);
            }
            debug!(%id_type, attempt, start, "lost id range race, retrying");
        }
        Err(RaftError::AllocationFailed {
            id_type: id_type.to_string(),
            attempts,
        })
    }
}

struct Cursor {
    next: u64,
    end: u64,
}

/// Serves ids of one type from ranges won through the log.
///
/// Ranges from before a restart are never reused; the first call after start
/// always acquires a fresh range.
pub struct ReplicatedIdGenerator<R: Replicator> {
    id_type: IdType,
    acquirer: Arc<ReplicatedIdRangeAcquirer<R>>,
    current: Mutex<Option<Cursor>>,
}

impl<R: Replicator> ReplicatedIdGenerator<R> {
    pub fn new(id_type: IdType, acquirer: Arc<ReplicatedIdRangeAcquirer<R>>) -> Self {
        Self {
            id_type,
            acquirer,
            current: Mutex::new(None),
        }
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    pub fn next_id(&self) -> Result<u64> {
        let mut current = self.current.lock();
        if let Some(cursor) = current.as_mut() {
            if cursor.next < cursor.end {
                let id = cursor.next;
                cursor.next += 1;
                return Ok(id);
            }
        }
        let range = self.acquirer.acquire(self.id_type)?;
        *current = Some(Cursor {
            next: range.start + 1,
            end: range.end(),
        });
        Ok(range.start)
    }
}
