use std::collections::{HashMap, HashSet};

use crate::types::{LogIndex, NodeId, Term};

/// Votes collected in one election (or pre-vote) round, the candidate's own included.
/// Keyed by voter, so a duplicated response is counted once.
#[derive(Debug, Clone)]
pub struct VoteTally {
    granted: HashSet<NodeId>,
}

impl VoteTally {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            granted: HashSet::from([self_id]),
        }
    }

    pub fn record(&mut self, from: NodeId) {
        self.granted.insert(from);
    }

    pub fn count(&self) -> usize {
        self.granted.len()
    }

    // §5.2: a candidate wins the election if it receives votes from a majority
    // of the servers in the full cluster (⌊N/2⌋ + 1 out of N servers).
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.granted.len() > cluster_size / 2
    }
}

/// §5.1: followers are passive. They issue no requests and only respond to RPCs from
/// leaders and candidates. If a follower receives no communication, it starts an election.
#[derive(Debug, Default)]
pub struct Follower {
    /// Leader heard from during the current election-timeout window.
    pub leader_id: Option<NodeId>,
    /// Pre-vote round in progress: the term being polled for and the grants so far.
    pub pre_vote: Option<(Term, VoteTally)>,
}

impl Follower {
    pub fn new(leader_id: Option<NodeId>) -> Self {
        Self {
            leader_id,
            pre_vote: None,
        }
    }

    pub fn set_leader(&mut self, leader_id: NodeId) {
        self.leader_id = Some(leader_id);
        self.pre_vote = None;
    }
}

/// §5.2: a candidate requests votes from peers to win an election. It votes for itself
/// and wins if it receives votes from a majority of servers in the full cluster.
#[derive(Debug)]
pub struct Candidate {
    pub votes: VoteTally,
}

impl Candidate {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            votes: VoteTally::new(self_id),
        }
    }
}

/// Replication progress of one follower, as seen by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Next log index to send.
    pub next_index: LogIndex,
    /// Highest log index known to be replicated.
    pub match_index: LogIndex,
    /// Last included index of a snapshot sent and not yet acknowledged.
    pub pending_snapshot: Option<LogIndex>,
}

/// §5.3, Figure 2, Volatile state on leaders (reinitialized after election).
#[derive(Debug)]
pub struct Leader {
    progress: HashMap<NodeId, Progress>,
}

impl Leader {
    // nextIndex initialized to leader last log index + 1 (optimistic).
    // matchIndex initialized to 0 (conservative, increases monotonically).
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            progress: peers
                .iter()
                .map(|p| {
                    (
                        p.clone(),
                        Progress {
                            next_index: last_log_index.next(),
                            match_index: LogIndex::ZERO,
                            pending_snapshot: None,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn progress(&self, peer: &NodeId) -> Option<&Progress> {
        self.progress.get(peer)
    }

    pub fn next_index_for(&self, peer: &NodeId) -> Option<LogIndex> {
        self.progress.get(peer).map(|p| p.next_index)
    }

    pub fn match_index_for(&self, peer: &NodeId) -> Option<LogIndex> {
        self.progress.get(peer).map(|p| p.match_index)
    }

    /// Update follower progress after successful replication. Match indices never move
    /// backwards, so a reordered older response cannot undo newer progress.
    pub fn record_success(&mut self, from: &NodeId, match_index: LogIndex) {
        if let Some(p) = self.progress.get_mut(from) {
            if match_index > p.match_index {
                p.match_index = match_index;
            }
            p.next_index = p.match_index.next();
        }
    }

    /// Move next_index back after a rejected AppendEntries.
    ///
    /// `hint` is the leader-side jump target computed from the follower's conflict
    /// information; without one the index steps back by one. next_index never drops below
    /// match_index + 1 or below 1.
    pub fn record_failure(&mut self, from: &NodeId, hint: Option<LogIndex>) {
        if let Some(p) = self.progress.get_mut(from) {
            let stepped = p.next_index.prev().unwrap_or(LogIndex::ZERO);
            let target = match hint {
                Some(h) if h < p.next_index => h,
                _ => stepped,
            };
            p.next_index = target.max(p.match_index.next()).max(LogIndex::from(1));
        }
    }

    pub fn snapshot_sent(&mut self, to: &NodeId, last_included_index: LogIndex) {
        if let Some(p) = self.progress.get_mut(to) {
            p.pending_snapshot = Some(last_included_index);
        }
    }

    /// Acknowledged snapshot: the follower now holds everything it covered.
    pub fn snapshot_installed(&mut self, from: &NodeId) {
        if let Some(p) = self.progress.get_mut(from) {
            if let Some(index) = p.pending_snapshot.take() {
                if index > p.match_index {
                    p.match_index = index;
                }
                p.next_index = p.match_index.next();
            }
        }
    }

    /// Highest index stored on a majority, counting the leader's own `last_log_index`.
    pub fn quorum_match_index(&self, last_log_index: LogIndex, cluster_size: usize) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.progress.values().map(|p| p.match_index).collect();
        indices.push(last_log_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = cluster_size / 2 + 1;
        indices
            .get(quorum - 1)
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }
}
