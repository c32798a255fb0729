//! # state_machine
//!
//! why: apply committed commands exactly once, in index order, per machine
//! relations: machines are fed by apply.rs; id_alloc provides the allocator machine
//! what: StateMachine trait, StateMachineRegistry, transaction and membership machines

use crate::content::{MemberSet, ReplicatedContent, ReplicatedIdAllocationRequest};
use crate::error::Result;
use crate::log::{LogIndex, NO_INDEX};
use crate::watermark::IndexWatermark;
use std::sync::Arc;
use tracing::trace;

/// A consumer of committed log content.
///
/// `on_replicated` is called with strictly increasing indices. An index at or
/// below `last_applied_index` must be ignored without looking at the command.
/// A new index must update the domain state and the last applied index
/// together, so a crash leaves neither a gap nor a double apply.
pub trait StateMachine: Send {
    type Command;

    fn on_replicated(&mut self, command: &Self::Command, index: LogIndex) -> Result<()>;

    fn last_applied_index(&self) -> LogIndex;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Commits transactions into the storage engine
pub trait TransactionCommitProcess: Send {
    /// durable on return
    fn commit(&mut self, transaction: &[u8], index: LogIndex) -> Result<()>;

    /// index of the last transaction the store holds
    fn last_committed_index(&self) -> LogIndex;
}

/// Feeds replicated transactions to the storage engine exactly once
pub struct ReplicatedTransactionStateMachine<P: TransactionCommitProcess> {
    process: P,
    last_committed: Arc<IndexWatermark>,
}

impl<P: TransactionCommitProcess> ReplicatedTransactionStateMachine<P> {
    pub fn new(process: P) -> Self {
        let last_committed = Arc::new(IndexWatermark::new(process.last_committed_index()));
        Self {
            process,
            last_committed,
        }
    }

    /// highest committed transaction index, readable without locks
    pub fn last_committed(&self) -> Arc<IndexWatermark> {
        Arc::clone(&self.last_committed)
    }
}

impl<P: TransactionCommitProcess> StateMachine for ReplicatedTransactionStateMachine<P> {
    type Command = Vec<u8>;

    fn on_replicated(&mut self, transaction: &Vec<u8>, index: LogIndex) -> Result<()> {
        if index <= self.process.last_committed_index() {
            trace!(index, "transaction already committed");
            return Ok(());
        }
        self.process.commit(transaction, index)?;
        self.last_committed.offer(index);
        Ok(())
    }

    fn last_applied_index(&self) -> LogIndex {
        self.process.last_committed_index()
    }
}

/// Tracks the newest member set written to the log
#[derive(Debug, Default)]
pub struct MembershipStateMachine {
    latest: Option<(LogIndex, MemberSet)>,
    last_applied: Option<LogIndex>,
}

impl MembershipStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&MemberSet> {
        self.latest.as_ref().map(|(_, set)| set)
    }

    pub fn latest_index(&self) -> Option<LogIndex> {
        self.latest.as_ref().map(|(index, _)| *index)
    }
}

impl StateMachine for MembershipStateMachine {
    type Command = MemberSet;

    fn on_replicated(&mut self, members: &MemberSet, index: LogIndex) -> Result<()> {
        if index <= self.last_applied_index() {
            return Ok(());
        }
        self.latest = Some((index, members.clone()));
        self.last_applied = Some(index);
        Ok(())
    }

    fn last_applied_index(&self) -> LogIndex {
        self.last_applied.unwrap_or(NO_INDEX)
    }
}

type IdAllocationMachine = Box<dyn StateMachine<Command = ReplicatedIdAllocationRequest>>;
type TransactionMachine = Box<dyn StateMachine<Command = Vec<u8>>>;
type MembershipMachine = Box<dyn StateMachine<Command = MemberSet>>;

/// Routes each content kind to the machine that owns it.
///
/// Built once at startup and handed to the applier; dropped at shutdown.
#[derive(Default)]
pub struct StateMachineRegistry {
    id_allocation: Option<IdAllocationMachine>,
    transactions: Option<TransactionMachine>,
    membership: Option<MembershipMachine>,
}

impl StateMachineRegistry {
    pub fn builder() -> StateMachineRegistryBuilder {
        StateMachineRegistryBuilder::default()
    }

    pub fn dispatch(&mut self, content: &ReplicatedContent, index: LogIndex) -> Result<()> {
        match content {
            ReplicatedContent::IdAllocation(request) => match self.id_allocation.as_mut() {
                Some(machine) => machine.on_replicated(request, index),
                None => Ok(()),
            },
            ReplicatedContent::Transaction(tx) => match self.transactions.as_mut() {
                Some(machine) => machine.on_replicated(tx, index),
                None => Ok(()),
            },
            ReplicatedContent::MemberSet(members) => match self.membership.as_mut() {
                Some(machine) => machine.on_replicated(members, index),
                None => Ok(()),
            },
            ReplicatedContent::NewLeaderBarrier => {
                trace!(index, "leader barrier committed");
                Ok(())
            }
        }
    }

    /// the point from which every registered machine is caught up
    pub fn lowest_last_applied(&self) -> LogIndex {
        let indices = [
            self.id_allocation.as_ref().map(|m| m.last_applied_index()),
            self.transactions.as_ref().map(|m| m.last_applied_index()),
            self.membership.as_ref().map(|m| m.last_applied_index()),
        ];
        indices.into_iter().flatten().min().unwrap_or(NO_INDEX)
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(machine) = self.id_allocation.as_mut() {
            machine.flush()?;
        }
        if let Some(machine) = self.transactions.as_mut() {
            machine.flush()?;
        }
        if let Some(machine) = self.membership.as_mut() {
            machine.flush()?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StateMachineRegistryBuilder {
    registry: StateMachineRegistry,
}

impl StateMachineRegistryBuilder {
    pub fn id_allocation(
        mut self,
        machine: impl StateMachine<Command = ReplicatedIdAllocationRequest> + 'static,
    ) -> Self {
        self.registry.id_allocation = Some(Box::new(machine));
        self
    }

    pub fn transactions(mut self, machine: impl StateMachine<Command = Vec<u8>> + 'static) -> Self {
        self.registry.transactions = Some(Box::new(machine));
        self
    }

    pub fn membership(mut self, machine: impl StateMachine<Command = MemberSet> + 'static) -> Self {
        self.registry.membership = Some(Box::new(machine));
        self
    }

    pub fn build(self) -> StateMachineRegistry {
        self.registry
    }
}
