//! # apply
//!
//! why: move the committed prefix of the log into the state machines, one entry at a time
//! relations: reads any ReadableRaftLog, dispatches through StateMachineRegistry
//! what: CommitApplier with an applied-index watermark and fail-stop behaviour

use crate::error::{RaftError, Result};
use crate::log::{LogIndex, ReadableRaftLog};
use crate::state_machine::StateMachineRegistry;
use crate::watermark::IndexWatermark;
use std::sync::Arc;
use tracing::{debug, error};

/// Single ordered apply path for all registered machines.
///
/// Once an apply fails the applier refuses further work; the failure is
/// meant to take the member's role down.
pub struct CommitApplier {
    registry: StateMachineRegistry,
    applied: Arc<IndexWatermark>,
    failed_at: Option<LogIndex>,
}

impl CommitApplier {
    pub fn new(registry: StateMachineRegistry) -> Self {
        let applied = Arc::new(IndexWatermark::new(registry.lowest_last_applied()));
        Self {
            registry,
            applied,
            failed_at: None,
        }
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied.get()
    }

    pub fn applied_watermark(&self) -> Arc<IndexWatermark> {
        Arc::clone(&self.applied)
    }

    pub fn registry(&self) -> &StateMachineRegistry {
        &self.registry
    }

    /// apply every entry up to `commit_index`, returns the applied index
    pub fn apply_committed<L: ReadableRaftLog + ?Sized>(
        &mut self,
        log: &L,
        commit_index: LogIndex,
    ) -> Result<LogIndex> {
        if let Some(index) = self.failed_at {
            return Err(RaftError::ApplierFailed { index });
        }
        // entries at or below prev_index are compacted committed state
        let compacted = log.prev_index();
        if compacted > self.applied.get() {
            debug!(
                applied_index = self.applied.get(),
                prev_index = compacted,
                "applier moved past compacted prefix"
            );
            self.applied.offer(compacted);
        }
        let from = self.applied.get() + 1;
        if from > commit_index {
            return Ok(self.applied.get());
        }

        for item in log.get_entry_cursor(from) {
            let next = self.applied.get() + 1;
            let (index, entry) = item.map_err(|e| self.fail(next, e))?;
            if index > commit_index {
                break;
            }
            self.registry
                .dispatch(&entry.content, index)
                .map_err(|e| self.fail(index, e))?;
            self.applied.offer(index);
        }
        let flushed_at = self.applied.get();
        self.registry.flush().map_err(|e| self.fail(flushed_at, e))?;

        debug!(applied_index = self.applied.get(), commit_index, "applied committed entries");
        Ok(self.applied.get())
    }

    fn fail(&mut self, index: LogIndex, err: RaftError) -> RaftError {
        error!(index, error = %err, "state machine apply failed, applier stopped");
        self.failed_at = Some(index);
        err
    }
}
