//! # node
//!
//! why: the leader-tracking side of a member that owns the local log
//! relations: uses reconcile.rs on the log, message.rs for rpc types, watermark.rs for commit
//! what: TermStore trait, RaftNode (append entries, heartbeat, prune, snapshot point)

use crate::config::RaftLogConfig;
use crate::content::MemberId;
use crate::error::{RaftError, Result};
use crate::log::{LogIndex, RaftLog, Term};
use crate::message::{AppendEntriesRequest, AppendEntriesResponse, Heartbeat, PruneRequest, RaftMessage};
use crate::reconcile::{reconcile, AppendOutcome};
use crate::watermark::IndexWatermark;
use std::sync::Arc;
use tracing::{debug, info};

/// durable storage of the highest term this member has seen
pub trait TermStore: Send {
    fn load_term(&self) -> Result<Term>;

    /// must be durable before returning
    fn save_term(&mut self, term: Term) -> Result<()>;
}

/// A cluster member's follower log.
///
/// Owns the RaftLog exclusively, so appends and truncations are serialized here.
pub struct RaftNode<L: RaftLog, S: TermStore> {
    id: MemberId,
    current_term: Term,
    log: L,
    term_store: S,
    commit_index: Arc<IndexWatermark>,
    config: RaftLogConfig,
}

impl<L: RaftLog, S: TermStore> RaftNode<L, S> {
    /// Create a node over a fresh or recovered log
    pub fn new(id: MemberId, log: L, term_store: S, config: RaftLogConfig) -> Result<Self> {
        let current_term = term_store.load_term()?;
        // everything at or below prev_index was committed before it was compacted
        let commit_index = Arc::new(IndexWatermark::new(log.prev_index()));
        info!(
            member = %id,
            term = current_term,
            prev_index = log.prev_index(),
            append_index = log.append_index(),
            "raft node started"
        );
        Ok(Self {
            id,
            current_term,
            log,
            term_store,
            commit_index,
            config,
        })
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.get()
    }

    /// shared handle for the applier to watch
    pub fn commit_watermark(&self) -> Arc<IndexWatermark> {
        Arc::clone(&self.commit_index)
    }

    /// route a message, returning the reply if the message expects one
    pub fn handle(&mut self, message: RaftMessage) -> Result<Option<RaftMessage>> {
        match message {
            RaftMessage::AppendEntries(request) => self
                .handle_append_entries(&request)
                .map(|response| Some(RaftMessage::AppendEntriesResponse(response))),
            RaftMessage::Heartbeat(heartbeat) => {
                self.handle_heartbeat(&heartbeat)?;
                Ok(None)
            }
            RaftMessage::Prune(PruneRequest { prune_index }) => {
                self.prune(prune_index)?;
                Ok(None)
            }
            RaftMessage::AppendEntriesResponse(_) => Ok(None),
        }
    }

    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.leader_term < self.current_term {
            debug!(
                leader_term = request.leader_term,
                current_term = self.current_term,
                "ignoring append from stale leader"
            );
            return Ok(self.reject());
        }
        self.observe_term(request.leader_term)?;

        match reconcile(&self.log, request, self.commit_index.get())? {
            AppendOutcome::Accepted { match_index, .. } => {
                let commit = request.leader_commit.min(match_index);
                if self.commit_index.offer(commit) {
                    debug!(commit_index = commit, "commit index advanced");
                }
                Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: true,
                    match_index,
                    append_index: self.log.append_index(),
                })
            }
            AppendOutcome::Rejected(_) => Ok(self.reject()),
        }
    }

    pub fn handle_heartbeat(&mut self, heartbeat: &Heartbeat) -> Result<()> {
        if heartbeat.leader_term < self.current_term {
            return Ok(());
        }
        self.observe_term(heartbeat.leader_term)?;

        let index = heartbeat.commit_index;
        let known = if index <= self.log.prev_index() {
            true
        } else if index <= self.log.append_index() {
            self.log.read_entry_term(index)? == heartbeat.commit_index_term
        } else {
            false
        };
        if known && self.commit_index.offer(index) {
            debug!(commit_index = index, "commit index advanced by heartbeat");
        }
        Ok(())
    }

    /// Prune up to `applied_index` less the configured margin, never past commit.
    pub fn prune(&mut self, applied_index: LogIndex) -> Result<LogIndex> {
        let margin = self.config.prune_safety_margin as LogIndex;
        let safe_index = applied_index
            .saturating_sub(margin)
            .min(self.commit_index.get());
        if safe_index <= self.log.prev_index() {
            return Ok(self.log.prev_index());
        }
        let prev_index = self.log.prune(safe_index)?;
        debug!(safe_index, prev_index, "log pruned");
        Ok(prev_index)
    }

    /// Move the log past a snapshot taken at `(index, term)`.
    ///
    /// A log that already holds `(index, term)` is left alone. A local entry at
    /// `index` with another term is dropped together with everything after it,
    /// unless it is already committed.
    pub fn install_snapshot_point(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index < self.log.prev_index() {
            return Ok(());
        }
        if index <= self.log.append_index() {
            let local = self.log.read_entry_term(index)?;
            if local == term {
                self.commit_index.offer(index);
                debug!(index, term, "snapshot point already in log");
                return Ok(());
            }
            let commit_index = self.commit_index.get();
            if index <= commit_index {
                return Err(RaftError::TruncateCommitted {
                    from_index: index,
                    commit_index,
                });
            }
            info!(
                from_index = index,
                local_term = local,
                term,
                "dropping entries that conflict with snapshot point"
            );
            self.log.truncate(index)?;
        }
        self.log.skip(index, term)?;
        self.commit_index.offer(index);
        info!(index, term, "log skipped to snapshot point");
        Ok(())
    }

    fn observe_term(&mut self, term: Term) -> Result<()> {
        if term > self.current_term {
            self.term_store.save_term(term)?;
            self.current_term = term;
        }
        Ok(())
    }

    fn reject(&self) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: -1,
            append_index: self.log.append_index(),
        }
    }
}
