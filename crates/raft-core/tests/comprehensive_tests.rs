//! # comprehensive raft tests
//!
//! why: verify the follower log, appliers and id allocation work together end to end
//! relations: tests raft-core against raft-storage backends
//! what: reconciliation, commit tracking, state machine apply, id range races, work combining

use parking_lot::Mutex;
use raft_core::id_alloc::{
    IdGeneratorUpdates, IdGeneratorWorkSyncs, IdMark, IdMarkTarget, IdRange, IdType, IdWatermarks,
    OwnedRangeHandoff, Replicator, ReplicatedIdAllocationStateMachine, ReplicatedIdGenerator,
    ReplicatedIdRangeAcquirer,
};
use raft_core::state_machine::{MembershipStateMachine, ReplicatedTransactionStateMachine};
use raft_core::{
    reconcile, AppendEntriesRequest, AppendOutcome, CommitApplier, Heartbeat, IdAllocationConfig,
    LogEntry, LogIndex, MemberId, MemberSet, PruneRequest, RaftError, RaftLog, RaftLogConfig,
    RaftMessage, RaftNode, ReadableRaftLog, RejectReason, ReplicatedContent,
    ReplicatedIdAllocationRequest, Result, StateMachine, StateMachineRegistry, Term, TermStore,
    TransactionCommitProcess, NO_INDEX,
};
use raft_storage::{
    FileTermStore, InMemoryIdAllocationStore, InMemoryRaftLog, InMemoryTermStore, SegmentedRaftLog,
};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn tx(term: Term) -> LogEntry {
    LogEntry::new(term, ReplicatedContent::Transaction(vec![term as u8]))
}

fn log_with_terms(terms: &[Term]) -> InMemoryRaftLog {
    let log = InMemoryRaftLog::new(64);
    let entries: Vec<_> = terms.iter().map(|t| tx(*t)).collect();
    log.append(&entries).unwrap();
    log
}

fn terms_of(log: &dyn ReadableRaftLog) -> Vec<Term> {
    log.get_entry_cursor(0).map(|r| r.unwrap().1.term).collect()
}

fn request(prev_log_index: LogIndex, prev_log_term: Term, terms: &[Term]) -> AppendEntriesRequest {
    AppendEntriesRequest {
        leader_term: terms.iter().copied().max().unwrap_or(prev_log_term),
        prev_log_index,
        prev_log_term,
        entries: terms.iter().map(|t| tx(*t)).collect(),
        leader_commit: NO_INDEX,
    }
}

const ELEVEN: [Term; 11] = [1, 1, 1, 2, 2, 2, 3, 3, 3, 3, 3];

// =============================================================================
// SECTION 1: LOG RECONCILIATION
// =============================================================================

mod reconciliation {
    use super::*;

    #[test]
    fn fully_matching_batch_leaves_log_untouched() {
        let log = log_with_terms(&ELEVEN);
        let outcome = reconcile(&log, &request(4, 2, &[2, 3, 3, 3]), NO_INDEX).unwrap();

        assert_eq!(
            outcome,
            AppendOutcome::Accepted {
                match_index: 8,
                truncated_from: None,
                appended: 0,
            }
        );
        assert_eq!(log.append_index(), 10);
        assert_eq!(log.read_entry_term(10).unwrap(), 3);
    }

    #[test]
    fn partial_mismatch_truncates_then_appends() {
        let log = log_with_terms(&ELEVEN);
        let outcome = reconcile(&log, &request(1, 1, &[1, 4, 4, 5, 5, 6, 6, 6]), NO_INDEX).unwrap();

        assert_eq!(
            outcome,
            AppendOutcome::Accepted {
                match_index: 9,
                truncated_from: Some(3),
                appended: 7,
            }
        );
        assert_eq!(log.append_index(), 9);
        assert_eq!(terms_of(&log), vec![1, 1, 1, 4, 4, 5, 5, 6, 6, 6]);
    }

    #[test]
    fn conflicting_prev_term_rejects_without_touching_log() {
        let log = log_with_terms(&ELEVEN);
        let outcome = reconcile(&log, &request(5, 3, &[3, 3]), NO_INDEX).unwrap();

        assert_eq!(
            outcome,
            AppendOutcome::Rejected(RejectReason::ConflictingTerm {
                index: 5,
                expected: 3,
                actual: 2,
            })
        );
        assert_eq!(terms_of(&log), ELEVEN.to_vec());
    }

    #[test]
    fn gap_after_append_index_is_rejected() {
        let log = log_with_terms(&[1, 1]);
        let outcome = reconcile(&log, &request(5, 1, &[1]), NO_INDEX).unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Rejected(RejectReason::LogTooShort { append_index: 1 })
        );
    }

    #[test]
    fn batch_past_the_end_is_appended() {
        let log = log_with_terms(&[1, 1]);
        let outcome = reconcile(&log, &request(1, 1, &[2, 2]), NO_INDEX).unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(terms_of(&log), vec![1, 1, 2, 2]);
    }

    #[test]
    fn repeated_delivery_is_idempotent() {
        let log = log_with_terms(&[1]);
        let batch = request(0, 1, &[1, 2, 2]);
        reconcile(&log, &batch, NO_INDEX).unwrap();
        let second = reconcile(&log, &batch, NO_INDEX).unwrap();
        assert_eq!(
            second,
            AppendOutcome::Accepted {
                match_index: 3,
                truncated_from: None,
                appended: 0,
            }
        );
        assert_eq!(terms_of(&log), vec![1, 1, 2, 2]);
    }

    #[test]
    fn prev_index_is_an_implicit_match() {
        let log = InMemoryRaftLog::new(8);
        log.skip(9, 4).unwrap();
        // the leader's view of term at 9 is irrelevant once it is compacted
        let outcome = reconcile(&log, &request(7, 1, &[1, 4, 5]), NO_INDEX).unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(log.append_index(), 10);
        assert_eq!(log.read_entry_term(10).unwrap(), 5);
    }

    #[test]
    fn truncating_committed_entries_is_refused() {
        let log = log_with_terms(&ELEVEN);
        let err = reconcile(&log, &request(1, 1, &[1, 4]), 5).unwrap_err();
        assert!(matches!(
            err,
            RaftError::TruncateCommitted {
                from_index: 3,
                commit_index: 5
            }
        ));
        assert_eq!(terms_of(&log), ELEVEN.to_vec());
    }

    #[test]
    fn reconcile_works_on_the_durable_log() {
        let dir = tempdir().unwrap();
        let log = SegmentedRaftLog::open(dir.path(), &RaftLogConfig::default()).unwrap();
        let entries: Vec<_> = ELEVEN.iter().map(|t| tx(*t)).collect();
        log.append(&entries).unwrap();
        reconcile(&log, &request(1, 1, &[1, 4, 4, 5, 5, 6, 6, 6]), NO_INDEX).unwrap();
        drop(log);

        let log = SegmentedRaftLog::open(dir.path(), &RaftLogConfig::default()).unwrap();
        assert_eq!(terms_of(&log), vec![1, 1, 1, 4, 4, 5, 5, 6, 6, 6]);
    }
}

// =============================================================================
// SECTION 2: RAFT NODE MESSAGE HANDLING
// =============================================================================

mod node {
    use super::*;

    fn node_with(terms: &[Term]) -> RaftNode<InMemoryRaftLog, InMemoryTermStore> {
        RaftNode::new(
            MemberId::random(),
            log_with_terms(terms),
            InMemoryTermStore::new(),
            RaftLogConfig {
                prune_safety_margin: 2,
                ..RaftLogConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn accepted_append_reports_match_and_commit() {
        let mut node = node_with(&[1, 1]);
        let mut req = request(1, 1, &[2, 2]);
        req.leader_commit = 10;
        let response = node.handle_append_entries(&req).unwrap();

        assert!(response.success);
        assert_eq!(response.match_index, 3);
        assert_eq!(response.append_index, 3);
        assert_eq!(response.term, 2);
        // commit never runs ahead of what is known to match
        assert_eq!(node.commit_index(), 3);
    }

    #[test]
    fn stale_leader_is_rejected() {
        let mut node = node_with(&[1]);
        node.handle_append_entries(&request(0, 1, &[3])).unwrap();
        let mut stale = request(1, 3, &[]);
        stale.leader_term = 2;
        let response = node.handle_append_entries(&stale).unwrap();

        assert!(!response.success);
        assert_eq!(response.term, 3);
        assert_eq!(response.match_index, -1);
    }

    #[test]
    fn empty_batch_acts_as_heartbeat() {
        let mut node = node_with(&[1, 1, 1]);
        let mut beat = request(2, 1, &[]);
        beat.leader_term = 1;
        beat.leader_commit = 1;
        let response = node.handle_append_entries(&beat).unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, 2);
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.log().append_index(), 2);
    }

    #[test]
    fn heartbeat_commits_only_known_entries() {
        let mut node = node_with(&[1, 1, 2]);
        node.handle_heartbeat(&Heartbeat {
            leader_term: 2,
            commit_index: 2,
            commit_index_term: 3,
        })
        .unwrap();
        assert_eq!(node.commit_index(), -1);

        node.handle_heartbeat(&Heartbeat {
            leader_term: 2,
            commit_index: 2,
            commit_index_term: 2,
        })
        .unwrap();
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn prune_keeps_margin_and_respects_commit() {
        let mut node = node_with(&[1, 1, 1, 1, 1, 1, 1, 1]);
        let mut req = request(7, 1, &[]);
        req.leader_term = 1;
        req.leader_commit = 4;
        node.handle_append_entries(&req).unwrap();

        // applied 7 less margin 2 would be 5, commit caps it at 4
        assert_eq!(node.prune(7).unwrap(), 4);
        assert_eq!(node.log().prev_index(), 4);
        assert_eq!(node.prune(3).unwrap(), 4);
    }

    #[test]
    fn messages_route_through_handle() {
        let mut node = node_with(&[1]);
        let reply = node
            .handle(RaftMessage::AppendEntries(request(0, 1, &[1])))
            .unwrap();
        assert!(matches!(
            reply,
            Some(RaftMessage::AppendEntriesResponse(r)) if r.success && r.append_index == 1
        ));
        assert!(node
            .handle(RaftMessage::Prune(PruneRequest { prune_index: 0 }))
            .unwrap()
            .is_none());
    }

    #[test]
    fn snapshot_point_moves_log_and_commit() {
        let mut node = node_with(&[]);
        node.install_snapshot_point(5_000_000_000, 9).unwrap();
        assert_eq!(node.log().prev_index(), 5_000_000_000);
        assert_eq!(node.commit_index(), 5_000_000_000);
    }

    #[test]
    fn snapshot_point_already_in_log_only_commits() {
        let mut node = node_with(&[1, 1, 1, 1, 1]);
        node.install_snapshot_point(3, 1).unwrap();
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.log().prev_index(), -1);
        assert_eq!(node.log().append_index(), 4);
    }

    #[test]
    fn conflicting_snapshot_point_replaces_local_entries() {
        let mut node = node_with(&[1, 1, 1, 1, 1]);
        node.install_snapshot_point(3, 7).unwrap();
        assert_eq!(node.log().prev_index(), 3);
        assert_eq!(node.log().prev_term(), 7);
        assert_eq!(node.log().append_index(), 3);
        assert_eq!(node.log().read_entry_term(3).unwrap(), 7);
        assert_eq!(node.commit_index(), 3);
    }

    #[test]
    fn snapshot_point_conflicting_with_commit_is_refused() {
        let mut node = node_with(&[1, 1, 1, 1, 1]);
        let mut req = request(4, 1, &[]);
        req.leader_term = 1;
        req.leader_commit = 3;
        node.handle_append_entries(&req).unwrap();

        assert!(matches!(
            node.install_snapshot_point(2, 7),
            Err(RaftError::TruncateCommitted { from_index: 2, commit_index: 3 })
        ));
        assert_eq!(node.log().append_index(), 4);
        assert_eq!(node.log().read_entry_term(2).unwrap(), 1);
    }

    #[test]
    fn higher_term_is_durable_before_reply() {
        let dir = tempdir().unwrap();
        let log = SegmentedRaftLog::open(dir.path(), &RaftLogConfig::default()).unwrap();
        let store = FileTermStore::open(dir.path()).unwrap();
        let mut node = RaftNode::new(MemberId::random(), log, store, RaftLogConfig::default()).unwrap();
        node.handle_append_entries(&request(-1, 0, &[6])).unwrap();
        drop(node);

        let store = FileTermStore::open(dir.path()).unwrap();
        assert_eq!(store.load_term().unwrap(), 6);
        let log = SegmentedRaftLog::open(dir.path(), &RaftLogConfig::default()).unwrap();
        let node = RaftNode::new(MemberId::random(), log, store, RaftLogConfig::default()).unwrap();
        assert_eq!(node.current_term(), 6);
        assert_eq!(node.log().append_index(), 0);
    }
}

// =============================================================================
// SECTION 3: STATE MACHINES AND THE COMMIT APPLIER
// =============================================================================

#[derive(Clone, Default)]
struct RecordingCommitProcess {
    committed: Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>,
    fail_at: Option<LogIndex>,
}

impl TransactionCommitProcess for RecordingCommitProcess {
    fn commit(&mut self, transaction: &[u8], index: LogIndex) -> Result<()> {
        if self.fail_at == Some(index) {
            return Err(RaftError::durability(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.committed.lock().push((index, transaction.to_vec()));
        Ok(())
    }

    fn last_committed_index(&self) -> LogIndex {
        self.committed.lock().last().map(|(i, _)| *i).unwrap_or(NO_INDEX)
    }
}

mod applier {
    use super::*;

    fn mixed_log() -> InMemoryRaftLog {
        let log = InMemoryRaftLog::new(64);
        log.append(&[
            LogEntry::new(1, ReplicatedContent::NewLeaderBarrier),
            LogEntry::new(1, ReplicatedContent::Transaction(b"a".to_vec())),
            LogEntry::new(1, ReplicatedContent::MemberSet(MemberSet::new(vec![MemberId::random()]))),
            LogEntry::new(2, ReplicatedContent::Transaction(b"b".to_vec())),
            LogEntry::new(2, ReplicatedContent::Transaction(b"c".to_vec())),
        ])
        .unwrap();
        log
    }

    #[test]
    fn applies_committed_prefix_in_order() {
        let log = mixed_log();
        let process = RecordingCommitProcess::default();
        let registry = StateMachineRegistry::builder()
            .transactions(ReplicatedTransactionStateMachine::new(process.clone()))
            .build();
        let mut applier = CommitApplier::new(registry);

        assert_eq!(applier.apply_committed(&log, 3).unwrap(), 3);
        assert_eq!(
            *process.committed.lock(),
            vec![(1, b"a".to_vec()), (3, b"b".to_vec())]
        );

        assert_eq!(applier.apply_committed(&log, 4).unwrap(), 4);
        assert_eq!(process.committed.lock().len(), 3);
        assert_eq!(applier.applied_watermark().get(), 4);
    }

    #[test]
    fn commit_behind_applied_is_a_noop() {
        let log = mixed_log();
        let mut applier = CommitApplier::new(StateMachineRegistry::builder().build());
        applier.apply_committed(&log, 2).unwrap();
        assert_eq!(applier.apply_committed(&log, 1).unwrap(), 2);
    }

    #[test]
    fn restart_resumes_after_slowest_machine() {
        let log = mixed_log();
        let process = RecordingCommitProcess::default();
        process.committed.lock().push((1, b"a".to_vec()));
        let mut membership = MembershipStateMachine::new();
        membership
            .on_replicated(&MemberSet::new(vec![MemberId::random()]), 2)
            .unwrap();
        let registry = StateMachineRegistry::builder()
            .transactions(ReplicatedTransactionStateMachine::new(process.clone()))
            .membership(membership)
            .build();

        let mut applier = CommitApplier::new(registry);
        assert_eq!(applier.applied_index(), 1);
        applier.apply_committed(&log, 4).unwrap();
        // index 1 is not committed a second time
        assert_eq!(
            process.committed.lock().iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![1, 3, 4]
        );
        assert_eq!(applier.applied_index(), 4);
        // membership saw no newer set, so a restart would resume after it
        assert_eq!(applier.registry().lowest_last_applied(), 2);
    }

    #[test]
    fn failed_apply_poisons_the_applier() {
        let log = mixed_log();
        let process = RecordingCommitProcess {
            fail_at: Some(3),
            ..RecordingCommitProcess::default()
        };
        let registry = StateMachineRegistry::builder()
            .transactions(ReplicatedTransactionStateMachine::new(process.clone()))
            .build();
        let mut applier = CommitApplier::new(registry);

        let err = applier.apply_committed(&log, 4).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(applier.applied_index(), 2);
        assert!(matches!(
            applier.apply_committed(&log, 4),
            Err(RaftError::ApplierFailed { index: 3 })
        ));
        assert_eq!(process.committed.lock().len(), 1);
    }

    #[test]
    fn compacted_prefix_is_stepped_over() {
        let log = mixed_log();
        log.prune(2).unwrap();
        let process = RecordingCommitProcess::default();
        let registry = StateMachineRegistry::builder()
            .transactions(ReplicatedTransactionStateMachine::new(process.clone()))
            .membership(MembershipStateMachine::new())
            .build();
        let mut applier = CommitApplier::new(registry);

        assert_eq!(applier.apply_committed(&log, 4).unwrap(), 4);
        assert_eq!(
            *process.committed.lock(),
            vec![(3, b"b".to_vec()), (4, b"c".to_vec())]
        );
    }

    #[test]
    fn applies_after_skip_to_snapshot_point() {
        let log = InMemoryRaftLog::new(16);
        log.skip(100, 1).unwrap();
        let member = Member::new(InMemoryIdAllocationStore::new());
        let request = ReplicatedIdAllocationRequest::new(member.id, IdType::Node, 0, 32);
        log.append(&[LogEntry::new(1, ReplicatedContent::IdAllocation(request))])
            .unwrap();

        let registry = StateMachineRegistry::builder()
            .id_allocation(member.machine)
            .build();
        let mut applier = CommitApplier::new(registry);
        assert_eq!(applier.apply_committed(&log, 101).unwrap(), 101);
        assert_eq!(applier.apply_committed(&log, 101).unwrap(), 101);
        assert_eq!(member.watermarks.get(IdType::Node), 32);
        assert_eq!(applier.registry().lowest_last_applied(), 101);
    }

    #[test]
    fn transaction_replay_commits_once() {
        let process = RecordingCommitProcess::default();
        let mut machine = ReplicatedTransactionStateMachine::new(process.clone());
        machine.on_replicated(&b"x".to_vec(), 7).unwrap();
        machine.on_replicated(&b"x".to_vec(), 7).unwrap();
        assert_eq!(process.committed.lock().len(), 1);
        assert_eq!(machine.last_applied_index(), 7);
    }
}

// =============================================================================
// SECTION 4: ID ALLOCATION
// =============================================================================

struct Member {
    id: MemberId,
    handoff: Arc<OwnedRangeHandoff>,
    watermarks: Arc<IdWatermarks>,
    machine: ReplicatedIdAllocationStateMachine<InMemoryIdAllocationStore>,
}

impl Member {
    fn new(store: InMemoryIdAllocationStore) -> Self {
        let id = MemberId::random();
        let handoff = Arc::new(OwnedRangeHandoff::new());
        let watermarks = Arc::new(IdWatermarks::new());
        let machine = ReplicatedIdAllocationStateMachine::new(
            id,
            store,
            Arc::clone(&handoff),
            Arc::clone(&watermarks),
        )
        .unwrap();
        Self {
            id,
            handoff,
            watermarks,
            machine,
        }
    }
}

/// Applies proposals straight to a single member's machine, optionally
/// letting a rival claim the same range first.
struct LocalReplicator {
    machine: Arc<Mutex<ReplicatedIdAllocationStateMachine<InMemoryIdAllocationStore>>>,
    next_index: AtomicI64,
    rival_wins: Mutex<u32>,
}

impl LocalReplicator {
    fn new(
        machine: ReplicatedIdAllocationStateMachine<InMemoryIdAllocationStore>,
        rival_wins: u32,
    ) -> Self {
        Self {
            machine: Arc::new(Mutex::new(machine)),
            next_index: AtomicI64::new(0),
            rival_wins: Mutex::new(rival_wins),
        }
    }
}

impl Replicator for LocalReplicator {
    fn replicate(&self, content: ReplicatedContent) -> Result<()> {
        let ReplicatedContent::IdAllocation(request) = content else {
            return Ok(());
        };
        let mut machine = self.machine.lock();
        let mut rival_wins = self.rival_wins.lock();
        if *rival_wins > 0 {
            *rival_wins -= 1;
            let rival = ReplicatedIdAllocationRequest { owner: MemberId::random(), ..request };
            machine.on_replicated(&rival, self.next_index.fetch_add(1, Ordering::SeqCst))?;
        }
        machine.on_replicated(&request, self.next_index.fetch_add(1, Ordering::SeqCst))
    }
}

/// One log shared by several members: each proposal gets the next index and is
/// applied to every member's machine before the proposer returns.
struct SharedLog {
    machines: Mutex<Vec<ReplicatedIdAllocationStateMachine<InMemoryIdAllocationStore>>>,
    next_index: AtomicI64,
    /// (range_start, accepted) per proposal in log order
    outcomes: Mutex<Vec<(u64, bool)>>,
    first_proposals: Barrier,
}

struct Proposer {
    log: Arc<SharedLog>,
    proposed: AtomicBool,
}

impl Replicator for Proposer {
    fn replicate(&self, content: ReplicatedContent) -> Result<()> {
        let ReplicatedContent::IdAllocation(request) = content else {
            return Ok(());
        };
        // every member reads the watermark before anyone's first proposal lands
        if !self.proposed.swap(true, Ordering::SeqCst) {
            self.log.first_proposals.wait();
        }
        let mut machines = self.log.machines.lock();
        let index = self.log.next_index.fetch_add(1, Ordering::SeqCst);
        let before = machines[0].first_unallocated(request.id_type);
        for machine in machines.iter_mut() {
            machine.on_replicated(&request, index)?;
        }
        let accepted = machines[0].first_unallocated(request.id_type) != before;
        self.log.outcomes.lock().push((request.range_start, accepted));
        Ok(())
    }
}

fn id_config(attempts: u32) -> IdAllocationConfig {
    IdAllocationConfig {
        default_range_length: 8,
        max_acquire_attempts: attempts,
        ..IdAllocationConfig::default()
    }
}

mod id_allocation {
    use super::*;

    #[test]
    fn racing_requests_accept_exactly_one() {
        let mut a = Member::new(InMemoryIdAllocationStore::new());
        let mut b = Member::new(InMemoryIdAllocationStore::new());
        let from_a = ReplicatedIdAllocationRequest::new(a.id, IdType::Node, 0, 1024);
        let from_b = ReplicatedIdAllocationRequest::new(b.id, IdType::Node, 0, 1024);

        // both members apply the same log: a's request at 0, b's at 1
        for member in [&mut a, &mut b] {
            member.machine.on_replicated(&from_a, 0).unwrap();
            member.machine.on_replicated(&from_b, 1).unwrap();
            assert_eq!(member.machine.first_unallocated(IdType::Node), 1024);
            assert_eq!(member.watermarks.get(IdType::Node), 1024);
            assert_eq!(member.machine.state().last_applied(), 1);
        }
        assert_eq!(a.handoff.take(IdType::Node), Some(IdRange::new(0, 1024)));
        assert_eq!(b.handoff.take(IdType::Node), None);
        assert_eq!(b.machine.owned_range(IdType::Node), None);
    }

    #[test]
    fn concurrent_acquirers_split_a_contended_range() {
        let mut machines = Vec::new();
        let mut proposers = Vec::new();
        for _ in 0..2 {
            let member = Member::new(InMemoryIdAllocationStore::new());
            proposers.push((member.id, member.handoff, member.watermarks));
            machines.push(member.machine);
        }
        let log = Arc::new(SharedLog {
            machines: Mutex::new(machines),
            next_index: AtomicI64::new(0),
            outcomes: Mutex::new(Vec::new()),
            first_proposals: Barrier::new(2),
        });

        let handles: Vec<_> = proposers
            .into_iter()
            .map(|(id, handoff, watermarks)| {
                let proposer = Proposer {
                    log: Arc::clone(&log),
                    proposed: AtomicBool::new(false),
                };
                let acquirer =
                    ReplicatedIdRangeAcquirer::new(id, proposer, handoff, watermarks, id_config(3));
                thread::spawn(move || acquirer.acquire(IdType::Node).unwrap())
            })
            .collect();
        let mut ranges: Vec<IdRange> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ranges.sort_by_key(|range| range.start);

        assert_eq!(ranges, vec![IdRange::new(0, 8), IdRange::new(8, 8)]);
        // both asked for [0, 8); only the first in log order got it
        assert_eq!(*log.outcomes.lock(), vec![(0, true), (0, false), (8, true)]);
        for machine in log.machines.lock().iter() {
            assert_eq!(machine.first_unallocated(IdType::Node), 16);
        }
    }

    #[test]
    fn overflowing_range_length_is_dropped() {
        let mut member = Member::new(InMemoryIdAllocationStore::new());
        let first = ReplicatedIdAllocationRequest::new(member.id, IdType::Node, 0, 10);
        let huge = ReplicatedIdAllocationRequest::new(member.id, IdType::Node, 10, u64::MAX);
        member.machine.on_replicated(&first, 0).unwrap();
        member.machine.on_replicated(&huge, 1).unwrap();

        assert_eq!(member.machine.first_unallocated(IdType::Node), 10);
        assert_eq!(member.machine.last_applied_index(), 1);
        assert_eq!(member.watermarks.get(IdType::Node), 10);
        assert_eq!(member.handoff.take(IdType::Node), Some(IdRange::new(0, 10)));
        assert_eq!(member.handoff.take(IdType::Node), None);
    }

    #[test]
    fn reapplying_an_index_changes_nothing() {
        let store = InMemoryIdAllocationStore::new();
        let mut member = Member::new(store.clone());
        let request = ReplicatedIdAllocationRequest::new(member.id, IdType::Property, 0, 16);
        member.machine.on_replicated(&request, 3).unwrap();
        let after_first = store.snapshot();
        member.handoff.take(IdType::Property);

        member.machine.on_replicated(&request, 3).unwrap();
        assert_eq!(store.snapshot(), after_first);
        assert_eq!(member.handoff.take(IdType::Property), None);
        assert_eq!(member.machine.first_unallocated(IdType::Property), 16);
    }

    #[test]
    fn reload_reproduces_watermark_and_owned_range() {
        let store = InMemoryIdAllocationStore::new();
        let id = {
            let mut member = Member::new(store.clone());
            let request = ReplicatedIdAllocationRequest::new(member.id, IdType::Relationship, 0, 64);
            member.machine.on_replicated(&request, 0).unwrap();
            member.id
        };

        let handoff = Arc::new(OwnedRangeHandoff::new());
        let watermarks = Arc::new(IdWatermarks::new());
        let machine =
            ReplicatedIdAllocationStateMachine::new(id, store, handoff, Arc::clone(&watermarks))
                .unwrap();
        assert_eq!(machine.first_unallocated(IdType::Relationship), 64);
        assert_eq!(machine.owned_range(IdType::Relationship), Some(IdRange::new(0, 64)));
        assert_eq!(machine.last_applied_index(), 0);
        assert_eq!(watermarks.get(IdType::Relationship), 64);
    }

    #[test]
    fn generator_serves_ids_from_won_ranges() {
        let member = Member::new(InMemoryIdAllocationStore::new());
        let (id, handoff, watermarks) = (member.id, member.handoff, member.watermarks);
        let replicator = LocalReplicator::new(member.machine, 0);
        let acquirer = Arc::new(ReplicatedIdRangeAcquirer::new(
            id,
            replicator,
            handoff,
            watermarks,
            id_config(3),
        ));
        let generator = ReplicatedIdGenerator::new(IdType::Node, acquirer);

        let ids: Vec<u64> = (0..20).map(|_| generator.next_id().unwrap()).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn lost_race_is_retried_with_fresh_watermark() {
        let member = Member::new(InMemoryIdAllocationStore::new());
        let (id, handoff, watermarks) = (member.id, member.handoff, member.watermarks);
        let acquirer = ReplicatedIdRangeAcquirer::new(
            id,
            LocalReplicator::new(member.machine, 1),
            handoff,
            Arc::clone(&watermarks),
            id_config(3),
        );

        // the rival takes [0, 8), our first proposal is dropped
        assert_eq!(acquirer.acquire(IdType::LabelToken).unwrap(), IdRange::new(8, 8));
        assert_eq!(watermarks.get(IdType::LabelToken), 16);
    }

    #[test]
    fn acquisition_gives_up_after_configured_attempts() {
        let member = Member::new(InMemoryIdAllocationStore::new());
        let (id, handoff, watermarks) = (member.id, member.handoff, member.watermarks);
        let acquirer = ReplicatedIdRangeAcquirer::new(
            id,
            LocalReplicator::new(member.machine, 5),
            handoff,
            watermarks,
            id_config(2),
        );
        assert!(matches!(
            acquirer.acquire(IdType::Schema),
            Err(RaftError::AllocationFailed { attempts: 2, .. })
        ));
    }

    #[test]
    fn registry_routes_allocations_to_the_allocator() {
        let store = InMemoryIdAllocationStore::new();
        let member = Member::new(store.clone());
        let request = ReplicatedIdAllocationRequest::new(member.id, IdType::NodeLabels, 0, 32);
        let log = InMemoryRaftLog::new(8);
        log.append(&[LogEntry::new(1, ReplicatedContent::IdAllocation(request))])
            .unwrap();

        let registry = StateMachineRegistry::builder()
            .id_allocation(member.machine)
            .build();
        let mut applier = CommitApplier::new(registry);
        applier.apply_committed(&log, 0).unwrap();

        assert_eq!(store.snapshot().first_unallocated(IdType::NodeLabels), 32);
        assert_eq!(member.handoff.take(IdType::NodeLabels), Some(IdRange::new(0, 32)));
    }
}

// =============================================================================
// SECTION 5: ID GENERATOR WORK COMBINING
// =============================================================================

mod work_combining {
    use super::*;

    #[derive(Clone, Default)]
    struct SlowTarget {
        flushes: Arc<Mutex<Vec<usize>>>,
        marks: Arc<Mutex<Vec<IdMark>>>,
    }

    impl IdMarkTarget for SlowTarget {
        fn mark(&mut self, marks: &[IdMark]) -> Result<()> {
            thread::sleep(std::time::Duration::from_millis(1));
            self.flushes.lock().push(marks.len());
            self.marks.lock().extend_from_slice(marks);
            Ok(())
        }
    }

    #[test]
    fn every_caller_returns_after_its_marks_land() {
        let target = SlowTarget::default();
        let syncs = Arc::new(IdGeneratorWorkSyncs::new(vec![(
            IdType::Node,
            Box::new(target.clone()) as Box<dyn IdMarkTarget>,
        )]));

        let handles: Vec<_> = (0..6u64)
            .map(|t| {
                let syncs = Arc::clone(&syncs);
                let marks = Arc::clone(&target.marks);
                thread::spawn(move || {
                    for i in 0..10u64 {
                        let id = t * 100 + i;
                        syncs.apply(IdType::Node, IdGeneratorUpdates::used([id])).unwrap();
                        assert!(marks.lock().contains(&IdMark::Used(id)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(target.marks.lock().len(), 60);
        assert_eq!(target.flushes.lock().iter().sum::<usize>(), 60);
    }

    #[test]
    fn separate_generators_do_not_share_batches() {
        let nodes = SlowTarget::default();
        let rels = SlowTarget::default();
        let syncs = IdGeneratorWorkSyncs::new(vec![
            (IdType::Node, Box::new(nodes.clone()) as Box<dyn IdMarkTarget>),
            (IdType::Relationship, Box::new(rels.clone()) as Box<dyn IdMarkTarget>),
        ]);
        syncs.apply(IdType::Node, IdGeneratorUpdates::used([1])).unwrap();
        syncs
            .apply(IdType::Relationship, IdGeneratorUpdates::freed([2, 3]))
            .unwrap();

        assert_eq!(*nodes.marks.lock(), vec![IdMark::Used(1)]);
        assert_eq!(*rels.marks.lock(), vec![IdMark::Free(2), IdMark::Free(3)]);
    }
}
