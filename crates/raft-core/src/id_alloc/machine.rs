//! # id allocation state machine
//!
//! why: decide races for id ranges deterministically on every member
//! relations: fed by the registry in state_machine.rs, persists through IdAllocationStore
//! what: ReplicatedIdAllocationStateMachine

use super::{IdAllocationState, IdAllocationStore, IdType, IdTypeState, IdWatermarks, OwnedRangeHandoff};
use crate::content::{MemberId, ReplicatedIdAllocationRequest};
use crate::error::Result;
use crate::log::LogIndex;
use crate::state_machine::StateMachine;
use std::sync::Arc;
use tracing::{debug, trace};

/// Accepts an allocation request iff it starts exactly at the current
/// first-unallocated id for its type; everything else lost a race and is
/// dropped.
pub struct ReplicatedIdAllocationStateMachine<S: IdAllocationStore> {
    me: MemberId,
    store: S,
    state: IdAllocationState,
    handoff: Arc<OwnedRangeHandoff>,
    watermarks: Arc<IdWatermarks>,
}

impl<S: IdAllocationStore> ReplicatedIdAllocationStateMachine<S> {
    pub fn new(
        me: MemberId,
        mut store: S,
        handoff: Arc<OwnedRangeHandoff>,
        watermarks: Arc<IdWatermarks>,
    ) -> Result<Self> {
        let state = store.load()?;
        for (id_type, type_state) in state.iter() {
            watermarks.offer(id_type, type_state.first_unallocated);
        }
        debug!(member = %me, last_applied = state.last_applied(), "id allocation state loaded");
        Ok(Self {
            me,
            store,
            state,
            handoff,
            watermarks,
        })
    }

    pub fn first_unallocated(&self, id_type: IdType) -> u64 {
        self.state.first_unallocated(id_type)
    }

    /// highest range this member has won for `id_type`
    pub fn owned_range(&self, id_type: IdType) -> Option<super::IdRange> {
        self.state.owned_range(id_type)
    }

    pub fn state(&self) -> &IdAllocationState {
        &self.state
    }
}

impl<S: IdAllocationStore> StateMachine for ReplicatedIdAllocationStateMachine<S> {
    type Command = ReplicatedIdAllocationRequest;

    fn on_replicated(&mut self, request: &ReplicatedIdAllocationRequest, index: LogIndex) -> Result<()> {
        if index <= self.state.last_applied() {
            trace!(index, "id allocation already applied");
            return Ok(());
        }

        let id_type = request.id_type;
        let current = self.state.type_state(id_type);
        // a range running past u64::MAX can never be handed out
        let range_end = current.first_unallocated.checked_add(request.range_length);
        let accepted = request.range_start == current.first_unallocated && range_end.is_some();
        let mut updated = current;
        if let (true, Some(first_unallocated)) = (accepted, range_end) {
            updated = IdTypeState {
                first_unallocated,
                owned_range: if request.owner == self.me {
                    Some(request.range())
                } else {
                    current.owned_range
                },
            };
        } else {
            debug!(
                %id_type,
                range_start = request.range_start,
                range_length = request.range_length,
                first_unallocated = current.first_unallocated,
                "dropping stale id allocation request"
            );
        }

        // domain state and last applied index go to disk as one record
        let mut next = self.state.clone();
        next.set_type_state(id_type, updated);
        next.set_last_applied(index);
        self.store.persist(&next, id_type)?;
        self.state = next;

        if accepted {
            self.watermarks.offer(id_type, updated.first_unallocated);
            if request.owner == self.me {
                self.handoff.publish(id_type, request.range());
            }
        }
        Ok(())
    }

    fn last_applied_index(&self) -> LogIndex {
        self.state.last_applied()
    }
}
