use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::Result;
use crate::log::RaftLog;
use crate::options::ValidatedOptions;
use crate::state::{Candidate, Follower, Leader, VoteTally};
use crate::storage::{HardState, Stores};
use crate::types::{
    AppendEntries, AppendEntriesResponse, InstallSnapshot, InstallSnapshotResponse, LogEntry,
    LogIndex, Message, NodeId, RequestVote, RequestVoteResponse, Snapshot, Term,
};

/// Volatile state on all servers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VolatileState {
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// Server role with associated state.
#[derive(Debug)]
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
        }
    }
}

/// Role without its state, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: RoleKind,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
}

/// A Raft node.
///
/// The node performs no I/O of its own beyond the stores: every message, timer rearm
/// and snapshot restore is queued as a `Command` for the runtime to carry out. Store
/// writes happen before the in-memory state changes and before any command that
/// depends on them is queued, so a failed write leaves nothing to retract.
pub struct Node {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub persistent: HardState,
    pub log: RaftLog,
    pub volatile: VolatileState,
    pub role: Role,
    options: ValidatedOptions,
    stores: Stores,
    commands: Vec<Command>,
}

impl Node {
    /// Recover a node from its stores. Starts as follower with no known leader.
    pub fn new(options: ValidatedOptions, stores: Stores) -> Result<Self> {
        let persistent = stores.state.load()?;
        let (snapshot_index, snapshot_term) = match stores.snapshot.load()? {
            Some(s) => (s.last_included_index, s.last_included_term),
            None => (LogIndex::ZERO, Term::ZERO),
        };
        let log = RaftLog::restore(snapshot_index, snapshot_term, stores.log.get_all()?)?;

        let id = options.node_id.clone();
        info!(
            node = %id,
            term = %persistent.current_term,
            last_index = %log.last_index(),
            snapshot = %snapshot_index,
            "restored node state"
        );

        Ok(Self {
            peers: options.peers(),
            id,
            persistent,
            log,
            volatile: VolatileState {
                commit_index: snapshot_index,
                last_applied: snapshot_index,
            },
            role: Role::Follower(Follower::default()),
            options,
            stores,
            commands: Vec::new(),
        })
    }

    pub fn options(&self) -> &ValidatedOptions {
        &self.options
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        match &self.role {
            Role::Leader(_) => Some(&self.id),
            Role::Follower(f) => f.leader_id.as_ref(),
            Role::Candidate(_) => None,
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role.kind(),
            term: self.persistent.current_term,
            leader_id: self.leader_id().cloned(),
            commit_index: self.volatile.commit_index,
            last_applied: self.volatile.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
        }
    }

    /// The snapshot currently held in the snapshot store.
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self.stores.snapshot.load()?)
    }

    /// Take the commands queued since the last call.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.commands.push(Command::Send { to, message });
    }

    fn persist_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.stores.state.save(term, voted_for.as_ref())?;
        self.persistent = HardState {
            current_term: term,
            voted_for,
        };
        Ok(())
    }

    fn append_to_log(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.stores.log.append(&entries)?;
        self.log.extend(entries);
        Ok(())
    }

    fn truncate_log_from(&mut self, index: LogIndex) -> Result<()> {
        self.stores.log.truncate_suffix(index)?;
        self.log.truncate_from(index);
        Ok(())
    }

    /// Push log appends deferred by the fsync policy to disk.
    pub fn flush_log(&mut self) -> Result<()> {
        Ok(self.stores.log.flush()?)
    }

    pub fn log_flush_interval(&self) -> Option<Duration> {
        self.stores.log.flush_interval()
    }

    /// Dispatch an inbound message. Requests queue their response as a `Send` back to `from`.
    pub fn handle_message(&mut self, from: NodeId, message: Message) -> Result<()> {
        match message {
            Message::RequestVote(req) => {
                let resp = self.handle_request_vote(req)?;
                self.send(from, Message::RequestVoteResponse(resp));
            }
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp)?,
            Message::AppendEntries(req) => {
                let resp = self.handle_append_entries(req)?;
                self.send(from, Message::AppendEntriesResponse(resp));
            }
            Message::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp)?
            }
            Message::InstallSnapshot(req) => {
                let resp = self.handle_install_snapshot(req)?;
                self.send(from, Message::InstallSnapshotResponse(resp));
            }
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, resp)?
            }
        }
        Ok(())
    }

    /// Adopt a term seen in any request or response. Returns whether it was newer.
    ///
    /// §5.1: if a server sees a larger term it updates its own, clears its vote and,
    /// if it was a candidate or leader, reverts to follower.
    fn observe_term(&mut self, term: Term) -> Result<bool> {
        if term <= self.persistent.current_term {
            return Ok(false);
        }
        self.persist_hard_state(term, None)?;
        match &mut self.role {
            Role::Follower(f) => {
                f.leader_id = None;
                f.pre_vote = None;
            }
            _ => {
                info!(node = %self.id, term = %term, "stepping down after seeing higher term");
                self.role = Role::Follower(Follower::default());
                self.commands.push(Command::ResetElectionTimer);
            }
        }
        Ok(true)
    }

    /// Accept `leader_id` as leader of the current term and restart the election timer.
    fn recognize_leader(&mut self, leader_id: &NodeId) {
        match &mut self.role {
            Role::Follower(f) => {
                if f.leader_id.as_ref() != Some(leader_id) {
                    info!(node = %self.id, term = %self.persistent.current_term, leader = %leader_id, "following leader");
                }
                f.set_leader(leader_id.clone());
            }
            _ => {
                info!(node = %self.id, term = %self.persistent.current_term, leader = %leader_id, "stepping down, leader elected");
                self.role = Role::Follower(Follower::new(Some(leader_id.clone())));
            }
        }
        self.commands.push(Command::ResetElectionTimer);
    }

    /// Called when the election timer fires. Follower/Candidate starts a new election,
    /// through a pre-vote round first when enabled.
    pub fn election_timeout(&mut self) -> Result<()> {
        match self.role {
            Role::Leader(_) => Ok(()),
            Role::Follower(_) if self.options.enable_pre_vote => self.start_pre_vote(),
            Role::Follower(_) | Role::Candidate(_) => self.start_election(),
        }
    }

    fn start_pre_vote(&mut self) -> Result<()> {
        let term = self.persistent.current_term.increment();
        info!(node = %self.id, term = %term, "election timeout, polling peers");

        let tally = VoteTally::new(self.id.clone());
        let won = tally.has_majority(self.options.cluster_size());
        self.role = Role::Follower(Follower {
            leader_id: None,
            pre_vote: Some((term, tally)),
        });
        if won {
            return self.start_election();
        }

        self.broadcast_vote_request(term, true);
        self.commands.push(Command::ResetElectionTimer);
        Ok(())
    }

    fn start_election(&mut self) -> Result<()> {
        let term = self.persistent.current_term.increment();
        self.persist_hard_state(term, Some(self.id.clone()))?;
        info!(node = %self.id, term = %term, "starting election");

        let candidate = Candidate::new(self.id.clone());
        let won = candidate.votes.has_majority(self.options.cluster_size());
        self.role = Role::Candidate(candidate);
        if won {
            return self.become_leader();
        }

        self.broadcast_vote_request(term, false);
        self.commands.push(Command::ResetElectionTimer);
        Ok(())
    }

    fn broadcast_vote_request(&mut self, term: Term, is_pre_vote: bool) {
        let request = RequestVote {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            is_pre_vote,
        };
        for peer in &self.peers {
            self.commands.push(Command::Send {
                to: peer.clone(),
                message: Message::RequestVote(request.clone()),
            });
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        let term = self.persistent.current_term;
        info!(node = %self.id, term = %term, last_index = %self.log.last_index(), "became leader");

        self.role = Role::Leader(Leader::new(&self.peers, self.log.last_index()));

        // A no-op of our own term lets entries from earlier terms commit.
        let noop = LogEntry::noop(self.log.last_index().next(), term);
        self.append_to_log(vec![noop])?;

        self.broadcast_append_entries()?;
        self.commands.push(Command::ResetHeartbeatTimer);
        Ok(())
    }

    /// §5.2, §5.4.1: grant iff the term is current, we have not voted for someone else
    /// in it, and the candidate's log is at least as up-to-date as ours.
    pub fn handle_request_vote(&mut self, req: RequestVote) -> Result<RequestVoteResponse> {
        if req.term < self.persistent.current_term {
            debug!(node = %self.id, candidate = %req.candidate_id, term = %req.term, "rejecting vote request from stale term");
            return Ok(RequestVoteResponse {
                term: self.persistent.current_term,
                vote_granted: false,
                is_pre_vote: req.is_pre_vote,
            });
        }

        if req.is_pre_vote {
            let granted = self.pre_vote_grantable(&req);
            debug!(node = %self.id, candidate = %req.candidate_id, term = %req.term, granted, "pre-vote");
            return Ok(RequestVoteResponse {
                term: self.persistent.current_term,
                vote_granted: granted,
                is_pre_vote: true,
            });
        }

        self.observe_term(req.term)?;

        let can_vote = match &self.persistent.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };
        let up_to_date = self.log.is_up_to_date(req.last_log_term, req.last_log_index);
        let granted = can_vote && up_to_date;

        if granted {
            if self.persistent.voted_for.is_none() {
                self.persist_hard_state(self.persistent.current_term, Some(req.candidate_id.clone()))?;
            }
            info!(node = %self.id, candidate = %req.candidate_id, term = %req.term, "granted vote");
            self.commands.push(Command::ResetElectionTimer);
        } else {
            debug!(node = %self.id, candidate = %req.candidate_id, term = %req.term, can_vote, up_to_date, "denied vote");
        }

        Ok(RequestVoteResponse {
            term: self.persistent.current_term,
            vote_granted: granted,
            is_pre_vote: false,
        })
    }

    /// Pre-votes change nothing. They are declined while a live leader is known, so a
    /// node rejoining after a partition cannot force a term change on a healthy cluster.
    fn pre_vote_grantable(&self, req: &RequestVote) -> bool {
        let leader_known = match &self.role {
            Role::Leader(_) => true,
            Role::Follower(f) => f.leader_id.is_some(),
            Role::Candidate(_) => false,
        };
        if leader_known {
            return false;
        }
        if req.term == self.persistent.current_term {
            if let Some(v) = &self.persistent.voted_for {
                if *v != req.candidate_id {
                    return false;
                }
            }
        }
        self.log.is_up_to_date(req.last_log_term, req.last_log_index)
    }

    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
    ) -> Result<()> {
        if self.observe_term(resp.term)? || !resp.vote_granted {
            return Ok(());
        }

        let cluster_size = self.options.cluster_size();
        let current = self.persistent.current_term;

        if resp.is_pre_vote {
            let won = match &mut self.role {
                Role::Follower(Follower {
                    pre_vote: Some((_, tally)),
                    ..
                }) => {
                    tally.record(from);
                    tally.has_majority(cluster_size)
                }
                _ => false,
            };
            if won {
                info!(node = %self.id, "pre-vote succeeded");
                self.start_election()?;
            }
            return Ok(());
        }

        let won = match &mut self.role {
            Role::Candidate(c) if resp.term == current => {
                debug!(node = %self.id, peer = %from, term = %current, "vote received");
                c.votes.record(from);
                c.votes.has_majority(cluster_size)
            }
            _ => false,
        };
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    /// §5.3: replicate entries after a consistency check on (prev_log_index, prev_log_term).
    pub fn handle_append_entries(&mut self, req: AppendEntries) -> Result<AppendEntriesResponse> {
        if req.term < self.persistent.current_term {
            return Ok(AppendEntriesResponse::rejected(self.persistent.current_term));
        }
        self.observe_term(req.term)?;
        self.recognize_leader(&req.leader_id);
        let term = self.persistent.current_term;

        let last_new = req.prev_log_index.plus(req.entries.len() as u64);
        let mut prev_index = req.prev_log_index;
        let mut prev_term = req.prev_log_term;
        let mut entries = req.entries;

        // Entries covered by our snapshot are committed, so they match by definition.
        let snapshot_index = self.log.snapshot_index();
        if prev_index < snapshot_index {
            entries.retain(|e| e.index > snapshot_index);
            prev_index = snapshot_index;
            prev_term = self.log.snapshot_term();
        }

        match self.log.term_at(prev_index) {
            None => {
                let conflict_index = self.log.last_index().next();
                debug!(node = %self.id, prev = %prev_index, conflict_index = %conflict_index, "missing previous entry");
                return Ok(AppendEntriesResponse {
                    conflict_index: Some(conflict_index),
                    ..AppendEntriesResponse::rejected(term)
                });
            }
            Some(existing) if existing != prev_term => {
                let conflict_index = self.log.first_index_of_term(existing).unwrap_or(prev_index);
                debug!(node = %self.id, prev = %prev_index, conflict_term = %existing, "previous entry term mismatch");
                return Ok(AppendEntriesResponse {
                    conflict_index: Some(conflict_index),
                    conflict_term: Some(existing),
                    ..AppendEntriesResponse::rejected(term)
                });
            }
            Some(_) => {}
        }

        // Skip entries we already hold; at the first conflict drop our suffix.
        let mut incoming = entries.into_iter();
        let mut to_append = Vec::new();
        for entry in incoming.by_ref() {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    debug!(node = %self.id, index = %entry.index, "truncating conflicting suffix");
                    debug_assert!(entry.index > self.volatile.commit_index);
                    self.truncate_log_from(entry.index)?;
                    to_append.push(entry);
                    break;
                }
                None => {
                    to_append.push(entry);
                    break;
                }
            }
        }
        to_append.extend(incoming);
        self.append_to_log(to_append)?;

        if req.leader_commit > self.volatile.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > self.volatile.commit_index {
                self.volatile.commit_index = commit;
            }
        }

        Ok(AppendEntriesResponse {
            term,
            success: true,
            match_index: last_new,
            conflict_index: None,
            conflict_term: None,
        })
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> Result<()> {
        if self.observe_term(resp.term)? || resp.term != self.persistent.current_term {
            return Ok(());
        }

        if resp.success {
            if let Role::Leader(leader) = &mut self.role {
                leader.record_success(&from, resp.match_index);
            } else {
                return Ok(());
            }
            self.advance_commit_index();
            if self.has_pending_entries(&from) {
                self.replicate_to(&from)?;
            }
        } else {
            let target = self.backtrack_target(&resp);
            if let Role::Leader(leader) = &mut self.role {
                leader.record_failure(&from, target);
                debug!(node = %self.id, peer = %from, next_index = ?leader.next_index_for(&from), "append rejected, backtracking");
            } else {
                return Ok(());
            }
            self.replicate_to(&from)?;
        }
        Ok(())
    }

    /// Where to resume replication after a rejection. With a conflict term, jump past
    /// our own last entry of that term if we have one, else to the follower's first index
    /// of it. `None` means step back by one.
    fn backtrack_target(&self, resp: &AppendEntriesResponse) -> Option<LogIndex> {
        match resp.conflict_term {
            Some(term) => self
                .log
                .last_index_of_term(term)
                .map(LogIndex::next)
                .or(resp.conflict_index),
            None => resp.conflict_index,
        }
    }

    fn has_pending_entries(&self, peer: &NodeId) -> bool {
        match &self.role {
            Role::Leader(leader) => leader
                .next_index_for(peer)
                .is_some_and(|next| next <= self.log.last_index()),
            _ => false,
        }
    }

    /// Commit the highest index stored on a majority, but only if it is from our own
    /// term (§5.4.2). Earlier entries commit along with it.
    fn advance_commit_index(&mut self) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let candidate =
            leader.quorum_match_index(self.log.last_index(), self.options.cluster_size());
        if candidate > self.volatile.commit_index
            && self.log.term_at(candidate) == Some(self.persistent.current_term)
        {
            debug!(node = %self.id, commit = %candidate, "commit index advanced");
            self.volatile.commit_index = candidate;
        }
    }

    /// Called when the heartbeat ticker fires. Leaders send AppendEntries to every peer.
    pub fn heartbeat_timeout(&mut self) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        self.broadcast_append_entries()?;
        self.commands.push(Command::ResetHeartbeatTimer);
        Ok(())
    }

    fn broadcast_append_entries(&mut self) -> Result<()> {
        for peer in self.peers.clone() {
            self.replicate_to(&peer)?;
        }
        Ok(())
    }

    /// Send the next batch to `peer`, or the snapshot if the entries it needs are compacted.
    fn replicate_to(&mut self, peer: &NodeId) -> Result<()> {
        let Role::Leader(leader) = &self.role else {
            return Ok(());
        };
        let Some(next) = leader.next_index_for(peer) else {
            return Ok(());
        };
        if next <= self.log.snapshot_index() {
            return self.send_snapshot(peer);
        }

        let prev_log_index = next.prev().unwrap_or(LogIndex::ZERO);
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            return self.send_snapshot(peer);
        };
        let entries = self
            .log
            .entries_from(next, self.options.max_entries_per_append());

        let request = AppendEntries {
            term: self.persistent.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.volatile.commit_index,
        };
        self.send(peer.clone(), Message::AppendEntries(request));
        Ok(())
    }

    fn send_snapshot(&mut self, peer: &NodeId) -> Result<()> {
        let Some(snapshot) = self.stores.snapshot.load()? else {
            warn!(node = %self.id, peer = %peer, "peer needs compacted entries but no snapshot is stored");
            return Ok(());
        };
        if let Role::Leader(leader) = &mut self.role {
            leader.snapshot_sent(peer, snapshot.last_included_index);
        }
        debug!(node = %self.id, peer = %peer, last_included = %snapshot.last_included_index, "sending snapshot");

        let request = InstallSnapshot {
            term: self.persistent.current_term,
            leader_id: self.id.clone(),
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            data: snapshot.data,
        };
        self.send(peer.clone(), Message::InstallSnapshot(request));
        Ok(())
    }

    /// §7: replace our log prefix (or the whole log) with the leader's snapshot.
    pub fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshot,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.persistent.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.persistent.current_term,
                success: false,
            });
        }
        self.observe_term(req.term)?;
        self.recognize_leader(&req.leader_id);
        let term = self.persistent.current_term;

        let index = req.last_included_index;
        if index <= self.log.snapshot_index() {
            return Ok(InstallSnapshotResponse {
                term,
                success: true,
            });
        }

        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: req.last_included_term,
            data: req.data,
        };
        self.stores.snapshot.save(&snapshot)?;

        if self.log.term_at(index) == Some(snapshot.last_included_term) {
            // We already hold the snapshot's last entry: keep what follows it.
            self.stores.log.truncate_prefix(index)?;
        } else {
            self.stores.log.truncate_suffix(LogIndex::from(1))?;
            self.log.truncate_from(self.log.first_index());
        }
        self.log.compact_through(index, snapshot.last_included_term);

        if index > self.volatile.commit_index {
            self.volatile.commit_index = index;
        }
        info!(node = %self.id, term = %term, last_included = %index, "installed snapshot");

        if self.volatile.last_applied < index {
            self.volatile.last_applied = index;
            self.commands.push(Command::RestoreSnapshot(snapshot));
        }

        Ok(InstallSnapshotResponse {
            term,
            success: true,
        })
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        resp: InstallSnapshotResponse,
    ) -> Result<()> {
        if self.observe_term(resp.term)?
            || resp.term != self.persistent.current_term
            || !resp.success
        {
            return Ok(());
        }
        if let Role::Leader(leader) = &mut self.role {
            leader.snapshot_installed(&from);
        } else {
            return Ok(());
        }
        self.advance_commit_index();
        if self.has_pending_entries(&from) {
            self.replicate_to(&from)?;
        }
        Ok(())
    }

    /// Append a client command. Returns its index if this node is leader, `None` otherwise.
    /// Replication happens on the next heartbeat.
    pub fn submit_command(&mut self, command: Vec<u8>) -> Result<Option<LogIndex>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let index = self.log.last_index().next();
        let entry = LogEntry::new(index, self.persistent.current_term, command);
        self.append_to_log(vec![entry])?;
        self.advance_commit_index();
        Ok(Some(index))
    }

    /// Next committed entry not yet applied, advancing last_applied past it.
    pub fn take_entry_to_apply(&mut self) -> Option<LogEntry> {
        if self.volatile.last_applied >= self.volatile.commit_index {
            return None;
        }
        let next = self.volatile.last_applied.next();
        let entry = self.log.get(next)?.clone();
        self.volatile.last_applied = next;
        Some(entry)
    }

    /// Whether enough entries were applied since the last snapshot to take a new one.
    pub fn should_snapshot(&self) -> bool {
        self.volatile
            .last_applied
            .distance_from(self.log.snapshot_index())
            >= self.options.snapshot_threshold
    }

    /// Store `data` (the state machine as of last_applied) as the new snapshot and drop the
    /// log prefix it covers.
    pub fn compact(&mut self, data: Vec<u8>) -> Result<()> {
        let through = self.volatile.last_applied;
        if through <= self.log.snapshot_index() {
            return Ok(());
        }
        let Some(term) = self.log.term_at(through) else {
            return Ok(());
        };

        let snapshot = Snapshot {
            last_included_index: through,
            last_included_term: term,
            data,
        };
        self.stores.snapshot.save(&snapshot)?;
        self.stores.log.truncate_prefix(through)?;
        self.log.compact_through(through, term);

        info!(node = %self.id, last_included = %through, term = %term, "log compacted into snapshot");
        Ok(())
    }
}
