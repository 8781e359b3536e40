//! The three role-specific bags of state a node carries, and the pure
//! decision logic that belongs to each: tallying votes as a candidate, and
//! tracking per-peer replication progress as a leader.

use std::collections::{HashMap, HashSet};

use crate::cluster::ClusterView;
use crate::ids::{Index, NodeId, Term};
use crate::log::{Log, LogCoords};
use crate::message::RaftRequest;

#[derive(Debug, Clone, Default)]
pub struct FollowerState {
    pub leader: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct CandidateState {
    election_term: Term,
    cluster_size: usize,
    votes_for: HashSet<NodeId>,
    votes_against: HashSet<NodeId>,
}

pub enum VoteOutcome {
    Remain(CandidateState),
    BecomeFollower(Term),
    BecomeLeader,
}

impl CandidateState {
    pub fn new(election_term: Term, cluster_size: usize) -> Self {
        CandidateState { election_term, cluster_size, votes_for: HashSet::new(), votes_against: HashSet::new() }
    }

    pub fn election_term(&self) -> Term {
        self.election_term
    }

    /// Record one peer's vote. A response carrying a higher term always
    /// wins and asks the caller to step down, regardless of `granted`.
    pub fn record_vote(mut self, from: NodeId, response_term: Term, granted: bool) -> VoteOutcome {
        if response_term > self.election_term {
            return VoteOutcome::BecomeFollower(response_term);
        }
        if granted {
            self.votes_for.insert(from);
        } else {
            self.votes_against.insert(from);
        }
        // +1 for the candidate's own implicit self-vote.
        if self.votes_for.len() + 1 > self.cluster_size / 2 {
            VoteOutcome::BecomeLeader
        } else {
            VoteOutcome::Remain(self)
        }
    }
}

/// A leader's view of one follower's replication progress.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub next_index: Index,
    pub match_index: Index,
}

#[derive(Debug)]
pub struct LeaderState {
    peers: HashMap<NodeId, Peer>,
}

pub enum LeaderResult {
    StepDown(Term),
    Ok { retry: Option<(NodeId, RaftRequest)> },
}

impl LeaderState {
    pub fn new(cluster: &ClusterView, last_appended: LogCoords) -> Self {
        let mut peers = HashMap::new();
        for peer in cluster.peers() {
            peers.insert(peer.clone(), Peer { next_index: last_appended.index + 1, match_index: 0 });
        }
        LeaderState { peers }
    }

    pub fn peer(&self, id: &NodeId) -> Option<&Peer> {
        self.peers.get(id)
    }

    fn requests_for_all(&self, log: &Log, current_term: Term, commit_index: Index) -> Vec<(NodeId, RaftRequest)> {
        self.peers
            .iter()
            .map(|(id, peer)| {
                let prev = if peer.next_index <= 1 {
                    LogCoords::EMPTY
                } else {
                    log.coords_for_index(peer.next_index - 1).unwrap_or(LogCoords::EMPTY)
                };
                let entries = log.entries_from(peer.next_index, usize::MAX);
                (id.clone(), RaftRequest::AppendEntries { prev, term: current_term, commit_index, entries })
            })
            .collect()
    }

    /// A plain heartbeat / resend round: rebuild each peer's `AppendEntries`
    /// from its current `next_index` without advancing anything.
    pub fn heartbeat_requests(&self, log: &Log, current_term: Term) -> Vec<(NodeId, RaftRequest)> {
        self.requests_for_all(log, current_term, log.latest_commit())
    }

    /// Append `data` to the local log and build the per-peer `AppendEntries`
    /// needed to replicate it, optimistically advancing `next_index` past
    /// whatever gets sent this round.
    pub fn make_append_entries(
        &mut self,
        log: &mut Log,
        current_term: Term,
        data: Vec<Vec<u8>>,
    ) -> (crate::log::AppendResult, Vec<(NodeId, RaftRequest)>) {
        let entries = data
            .into_iter()
            .map(|d| crate::log::LogEntry { term: current_term, data: d })
            .collect();
        let prev = log.latest_appended();
        let result = log
            .append(prev, current_term, entries)
            .expect("a leader's own log must always accept its own append");
        let commit_index = log.latest_commit();

        let mut requests = Vec::with_capacity(self.peers.len());
        for (id, peer) in self.peers.iter_mut() {
            let prev_coords = if peer.next_index <= 1 {
                LogCoords::EMPTY
            } else {
                log.coords_for_index(peer.next_index - 1).unwrap_or(LogCoords::EMPTY)
            };
            let sent = log.entries_from(peer.next_index, usize::MAX);
            peer.next_index += sent.len() as Index;
            requests.push((id.clone(), RaftRequest::AppendEntries { prev: prev_coords, term: current_term, commit_index, entries: sent }));
        }
        (result, requests)
    }

    /// Fold in one `AppendEntriesResponse`: advance match/next index on
    /// success, recompute the commit index, or back off and retry on
    /// failure.
    pub fn on_append_response(
        &mut self,
        from: &NodeId,
        log: &mut Log,
        current_term: Term,
        response_term: Term,
        success: bool,
        match_index: Index,
        max_append_size: usize,
    ) -> (Vec<LogCoords>, LeaderResult) {
        if response_term > current_term {
            return (Vec::new(), LeaderResult::StepDown(response_term));
        }

        if success {
            if let Some(peer) = self.peers.get_mut(from) {
                peer.match_index = peer.match_index.max(match_index);
                peer.next_index = peer.match_index + 1;
            }
            let committed = self.recompute_commit(log, current_term);
            (committed, LeaderResult::Ok { retry: None })
        } else {
            let retry = if let Some(peer) = self.peers.get_mut(from) {
                peer.next_index = peer.next_index.saturating_sub(1).max(1);
                let prev = if peer.next_index <= 1 {
                    LogCoords::EMPTY
                } else {
                    log.coords_for_index(peer.next_index - 1).unwrap_or(LogCoords::EMPTY)
                };
                let entries = log.entries_from(peer.next_index, max_append_size);
                Some((
                    from.clone(),
                    RaftRequest::AppendEntries { prev, term: current_term, commit_index: log.latest_commit(), entries },
                ))
            } else {
                None
            };
            (Vec::new(), LeaderResult::Ok { retry })
        }
    }

    fn recompute_commit(&self, log: &mut Log, current_term: Term) -> Vec<LogCoords> {
        let commit_index = log.latest_commit();
        let last_index = log.latest_appended().index;
        let cluster_majority = (self.peers.len() + 1) / 2 + 1;

        let mut candidate = commit_index;
        for n in (commit_index + 1)..=last_index {
            let mut count = 1; // self
            for peer in self.peers.values() {
                if peer.match_index >= n {
                    count += 1;
                }
            }
            if count >= cluster_majority && log.term_for_index(n) == Some(current_term) {
                candidate = n;
            }
        }

        if candidate > commit_index {
            log.commit(candidate)
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug)]
pub enum NodeRole {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl NodeRole {
    pub fn tag(&self) -> crate::message::RoleTag {
        match self {
            NodeRole::Follower(_) => crate::message::RoleTag::Follower,
            NodeRole::Candidate(_) => crate::message::RoleTag::Candidate,
            NodeRole::Leader(_) => crate::message::RoleTag::Leader,
        }
    }
}
