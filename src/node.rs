//! The node orchestrator: owns the log, persistent state, role, and timers,
//! and turns one `Input` into the corresponding `Output` and internal
//! bookkeeping. `on_message` is synchronous and has no knowledge of the
//! network -- everything about sockets lives in `transport`.

use crate::cluster::ClusterView;
use crate::ids::{NodeId, Term};
use crate::log::{Log, LogCoords, LogEntry};
use crate::message::{Input, Output, RaftMessage, RaftRequest, RaftResponse, RoleChangeEvent, RoleTag, TimerKind};
use crate::observer::NodeObserver;
use crate::persistence::PersistentStore;
use crate::persistent_state::{PersistentState, RequestVoteRequest};
use crate::role::{CandidateState, FollowerState, LeaderResult, LeaderState, NodeRole, VoteOutcome};
use crate::timer::{TimerDriver, TimerHandle};

pub struct Node<S: PersistentStore> {
    id: NodeId,
    cluster: ClusterView,
    persistent: PersistentState<S>,
    log: Log,
    role: NodeRole,
    timers: Box<dyn TimerDriver>,
    receive_heartbeat_handle: Option<Box<dyn TimerHandle>>,
    send_heartbeat_handle: Option<Box<dyn TimerHandle>>,
    observer: Box<dyn NodeObserver>,
    max_append_size: usize,
}

impl<S: PersistentStore> Node<S> {
    pub fn new(
        id: NodeId,
        cluster: ClusterView,
        store: S,
        timers: Box<dyn TimerDriver>,
        observer: Box<dyn NodeObserver>,
    ) -> Self {
        let persistent = PersistentState::load(store);
        let mut node = Node {
            id,
            cluster,
            persistent,
            log: Log::new(),
            role: NodeRole::Follower(FollowerState::default()),
            timers,
            receive_heartbeat_handle: None,
            send_heartbeat_handle: None,
            observer,
            max_append_size: 64,
        };
        node.reset_receive_heartbeat();
        node
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn role_tag(&self) -> RoleTag {
        self.role.tag()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term()
    }

    pub fn latest_commit(&self) -> crate::ids::Index {
        self.log.latest_commit()
    }

    pub fn latest_appended(&self) -> LogCoords {
        self.log.latest_appended()
    }

    pub fn log_entry(&self, index: crate::ids::Index) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    pub fn leader(&self) -> Option<NodeId> {
        match &self.role {
            NodeRole::Follower(f) => f.leader.clone(),
            NodeRole::Leader(_) => Some(self.id.clone()),
            NodeRole::Candidate(_) => None,
        }
    }

    // --- timer bookkeeping -------------------------------------------------

    fn reset_receive_heartbeat(&mut self) {
        if let Some(mut h) = self.receive_heartbeat_handle.take() {
            h.cancel();
        }
        self.receive_heartbeat_handle = Some(self.timers.schedule_receive_heartbeat());
    }

    fn cancel_receive_heartbeat(&mut self) {
        if let Some(mut h) = self.receive_heartbeat_handle.take() {
            h.cancel();
        }
    }

    fn reset_send_heartbeat(&mut self) {
        if let Some(mut h) = self.send_heartbeat_handle.take() {
            h.cancel();
        }
        self.send_heartbeat_handle = Some(self.timers.schedule_send_heartbeat());
    }

    fn cancel_send_heartbeat(&mut self) {
        if let Some(mut h) = self.send_heartbeat_handle.take() {
            h.cancel();
        }
    }

    // --- role transitions ---------------------------------------------------

    fn maybe_emit_role_change(&mut self, old_tag: RoleTag, new_tag: RoleTag) {
        if old_tag != new_tag {
            let term = self.persistent.current_term();
            self.observer.on_role_change(RoleChangeEvent { term, old_role: old_tag, new_role: new_tag });
        }
    }

    fn become_follower(&mut self, old_tag: RoleTag, leader: Option<NodeId>) {
        if old_tag == RoleTag::Leader {
            self.cancel_send_heartbeat();
        }
        self.role = NodeRole::Follower(FollowerState { leader });
        self.reset_receive_heartbeat();
        self.maybe_emit_role_change(old_tag, RoleTag::Follower);
    }

    fn become_candidate(&mut self, election_term: Term) {
        let old_tag = self.role_tag();
        self.role = NodeRole::Candidate(CandidateState::new(election_term, self.cluster.len()));
        self.reset_receive_heartbeat();
        self.maybe_emit_role_change(old_tag, RoleTag::Candidate);
    }

    fn become_leader(&mut self, old_tag: RoleTag) {
        let last_appended = self.log.latest_appended();
        self.role = NodeRole::Leader(LeaderState::new(&self.cluster, last_appended));
        self.cancel_receive_heartbeat();
        self.reset_send_heartbeat();
        self.maybe_emit_role_change(old_tag, RoleTag::Leader);
        self.observer.on_new_leader(self.id.clone());
    }

    fn leader_broadcast(&self, term: Term) -> Vec<(NodeId, RaftRequest)> {
        match &self.role {
            NodeRole::Leader(state) => state.heartbeat_requests(&self.log, term),
            _ => Vec::new(),
        }
    }

    fn collect_committed_entries(&self, coords: &[LogCoords]) -> Vec<(LogCoords, LogEntry)> {
        coords
            .iter()
            .filter_map(|c| self.log.entry_at(c.index).map(|e| (*c, e.clone())))
            .collect()
    }

    // --- the universal term rule --------------------------------------------

    fn apply_universal_term_rule(&mut self, incoming_term: Term) {
        if incoming_term > self.persistent.current_term() {
            self.persistent.observe_term(incoming_term);
            let old_tag = self.role_tag();
            self.become_follower(old_tag, None);
        }
    }

    // --- entry point ---------------------------------------------------------

    pub fn on_message(&mut self, input: Input) -> Output {
        match input {
            Input::Message { from, message: RaftMessage::Request(req) } => {
                self.apply_universal_term_rule(req.term());
                let resp = self.handle_request(from.clone(), req);
                Output::AddressedResponse(from, resp)
            }
            Input::Message { from, message: RaftMessage::Response(resp) } => {
                self.apply_universal_term_rule(resp.term());
                self.handle_response(from, resp)
            }
            Input::Timer(TimerKind::ReceiveHeartbeatTimeout) => self.handle_receive_heartbeat_timeout(),
            Input::Timer(TimerKind::SendHeartbeatTimeout) => self.handle_send_heartbeat_timeout(),
            Input::AppendData(data) => self.handle_append_data(data),
        }
    }

    fn handle_request(&mut self, from: NodeId, req: RaftRequest) -> RaftResponse {
        match req {
            RaftRequest::AppendEntries { prev, term, commit_index, entries } => {
                self.on_append_entries(from, prev, term, commit_index, entries)
            }
            RaftRequest::RequestVote { term, last_log } => self.on_request_vote(from, term, last_log),
        }
    }

    fn on_append_entries(
        &mut self,
        from: NodeId,
        prev: LogCoords,
        term: Term,
        commit_index: crate::ids::Index,
        entries: Vec<LogEntry>,
    ) -> RaftResponse {
        let current_term = self.persistent.current_term();
        if term < current_term {
            return RaftResponse::AppendEntriesResponse { term: current_term, success: false, match_index: 0 };
        }

        if let NodeRole::Leader(_) = &self.role {
            if term == current_term {
                panic!(
                    "safety violation: node {} received AppendEntries from {} while itself leader at term {}",
                    self.id, from, term
                );
            }
        }

        if let NodeRole::Follower(state) = &self.role {
            if state.leader.as_ref() != Some(&from) {
                let old_tag = self.role_tag();
                self.become_follower(old_tag, Some(from.clone()));
                self.observer.on_new_leader(from.clone());
            }
        } else {
            let old_tag = self.role_tag();
            self.become_follower(old_tag, Some(from.clone()));
            self.observer.on_new_leader(from.clone());
        }
        self.reset_receive_heartbeat();

        match self.log.append(prev, term, entries) {
            Ok(_result) => {
                let newly_committed = self.log.commit(commit_index);
                if !newly_committed.is_empty() {
                    let with_entries = self.collect_committed_entries(&newly_committed);
                    self.observer.on_committed(&with_entries);
                }
                let match_index = self.log.latest_appended().index;
                RaftResponse::AppendEntriesResponse { term: self.persistent.current_term(), success: true, match_index }
            }
            Err(_err) => {
                RaftResponse::AppendEntriesResponse { term: self.persistent.current_term(), success: false, match_index: 0 }
            }
        }
    }

    fn on_request_vote(&mut self, from: NodeId, term: Term, last_log: LogCoords) -> RaftResponse {
        let local = self.log.latest_appended();
        let before_term = self.persistent.current_term();
        let reply = self.persistent.cast_vote(local, from, RequestVoteRequest { term, last_log });
        if reply.term > before_term {
            let old_tag = self.role_tag();
            self.become_follower(old_tag, None);
        }
        RaftResponse::RequestVoteResponse { term: reply.term, granted: reply.granted }
    }

    fn handle_response(&mut self, from: NodeId, resp: RaftResponse) -> Output {
        match resp {
            RaftResponse::RequestVoteResponse { term, granted } => self.on_request_vote_response(from, term, granted),
            RaftResponse::AppendEntriesResponse { term, success, match_index } => {
                self.on_append_entries_response(from, term, success, match_index)
            }
        }
    }

    fn on_request_vote_response(&mut self, from: NodeId, term: Term, granted: bool) -> Output {
        let old_tag = self.role_tag();
        let old_role = std::mem::replace(&mut self.role, NodeRole::Follower(FollowerState::default()));
        let candidate_state = match old_role {
            NodeRole::Candidate(state) => state,
            other => {
                self.role = other;
                return Output::NoOp(format!("ignoring vote response from {from}: not a candidate"));
            }
        };

        match candidate_state.record_vote(from, term, granted) {
            VoteOutcome::Remain(state) => {
                self.role = NodeRole::Candidate(state);
                Output::NoOp("vote recorded; election pending".to_string())
            }
            VoteOutcome::BecomeFollower(new_term) => {
                self.persistent.observe_term(new_term);
                self.become_follower(old_tag, None);
                Output::NoOp(format!("stepping down; observed higher term {new_term}"))
            }
            VoteOutcome::BecomeLeader => {
                self.become_leader(old_tag);
                let term = self.persistent.current_term();
                Output::AddressedRequest(self.leader_broadcast(term))
            }
        }
    }

    fn on_append_entries_response(&mut self, from: NodeId, term: Term, success: bool, match_index: crate::ids::Index) -> Output {
        let old_tag = self.role_tag();
        let old_role = std::mem::replace(&mut self.role, NodeRole::Follower(FollowerState::default()));
        let mut leader_state = match old_role {
            NodeRole::Leader(state) => state,
            other => {
                self.role = other;
                return Output::NoOp(format!("ignoring append response from {from}: not leader"));
            }
        };

        let current_term = self.persistent.current_term();
        let (committed, result) = leader_state.on_append_response(
            &from,
            &mut self.log,
            current_term,
            term,
            success,
            match_index,
            self.max_append_size,
        );

        match result {
            LeaderResult::StepDown(new_term) => {
                self.persistent.observe_term(new_term);
                self.become_follower(old_tag, None);
                Output::NoOp(format!("stepping down; observed higher term {new_term} from {from}"))
            }
            LeaderResult::Ok { retry } => {
                self.role = NodeRole::Leader(leader_state);
                if !committed.is_empty() {
                    let with_entries = self.collect_committed_entries(&committed);
                    self.observer.on_committed(&with_entries);
                }
                match retry {
                    Some(req) => Output::AddressedRequest(vec![req]),
                    None => Output::NoOp("append acknowledged".to_string()),
                }
            }
        }
    }

    fn handle_receive_heartbeat_timeout(&mut self) -> Output {
        let term = self.persistent.begin_election(self.id.clone());
        if self.cluster.is_empty() {
            let old_tag = self.role_tag();
            self.become_leader(old_tag);
            return Output::AddressedRequest(self.leader_broadcast(term));
        }
        self.become_candidate(term);
        let last_log = self.log.latest_appended();
        let requests = self
            .cluster
            .peers()
            .iter()
            .map(|p| (p.clone(), RaftRequest::RequestVote { term, last_log }))
            .collect();
        Output::AddressedRequest(requests)
    }

    fn handle_send_heartbeat_timeout(&mut self) -> Output {
        match &self.role {
            NodeRole::Leader(_) => {
                self.reset_send_heartbeat();
                let term = self.persistent.current_term();
                Output::AddressedRequest(self.leader_broadcast(term))
            }
            _ => Output::NoOp("not leader; ignoring send-heartbeat timeout".to_string()),
        }
    }

    fn handle_append_data(&mut self, data: Vec<Vec<u8>>) -> Output {
        let old_role = std::mem::replace(&mut self.role, NodeRole::Follower(FollowerState::default()));
        let mut leader_state = match old_role {
            NodeRole::Leader(state) => state,
            other => {
                let leader_desc = match &other {
                    NodeRole::Follower(f) => f.leader.as_ref().map(|id| id.to_string()).unwrap_or_else(|| "none".to_string()),
                    NodeRole::Candidate(_) => "none".to_string(),
                    NodeRole::Leader(_) => unreachable!(),
                };
                self.role = other;
                return Output::NoOp(format!("not leader; leader is {leader_desc}"));
            }
        };
        let current_term = self.persistent.current_term();
        let (result, requests) = leader_state.make_append_entries(&mut self.log, current_term, data);
        self.role = NodeRole::Leader(leader_state);
        Output::AppendAccepted { first: result.first, last: result.last, requests }
    }
}

// --- the actor that gives a Node a single owning task -------------------

/// A cheaply cloneable front door to a running `Node`. Feeding it an
/// `Input` is the only way anything (a timer, a TCP connection handler)
/// reaches the node; the node itself is moved into one Tokio task and never
/// touched from anywhere else.
#[derive(Clone)]
pub struct NodeHandle {
    sender: tokio::sync::mpsc::UnboundedSender<ActorMessage>,
}

enum ActorMessage {
    Input(Input, Option<tokio::sync::oneshot::Sender<Output>>),
}

impl NodeHandle {
    /// Send an input and wait for the `Output` it produced.
    pub async fn request(&self, input: Input) -> anyhow::Result<Output> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ActorMessage::Input(input, Some(tx)))
            .map_err(|_| anyhow::anyhow!("node actor is no longer running"))?;
        rx.await.map_err(|_| anyhow::anyhow!("node actor dropped its reply"))
    }

    /// Send an input without waiting for a reply (used by timers).
    pub fn notify(&self, input: Input) {
        let _ = self.sender.send(ActorMessage::Input(input, None));
    }
}

/// The receiving half paired with a `NodeHandle` from `node_channel`. Kept
/// separate from `NodeHandle` so a `TimerDriver` can be built (and handed to
/// `Node::new`) before the `Node` it will eventually drive exists.
pub struct NodeInbox {
    receiver: tokio::sync::mpsc::UnboundedReceiver<ActorMessage>,
}

/// Create a handle/inbox pair up front, so a `TimerDriver` referencing the
/// handle can be constructed before the `Node` itself.
pub fn node_channel() -> (NodeHandle, NodeInbox) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (NodeHandle { sender: tx }, NodeInbox { receiver: rx })
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeHandle")
    }
}

impl crate::timer::InputSink for NodeHandle {
    fn send(&self, input: Input) {
        self.notify(input);
    }
}

/// Owns the `Node` exclusively and runs its message loop. Every `Output`,
/// whether it came from an inbound request, a response, a timer, or a
/// client's `AppendData`, is forwarded to `outputs` so the transport layer
/// can act on it.
pub struct NodeActor<S: PersistentStore + 'static> {
    node: Node<S>,
    inbox: tokio::sync::mpsc::UnboundedReceiver<ActorMessage>,
    outputs: tokio::sync::mpsc::UnboundedSender<Output>,
}

impl<S: PersistentStore + 'static> NodeActor<S> {
    /// Spawn a node that doesn't need its `NodeHandle` ahead of time (its
    /// `TimerDriver` doesn't loop back through one -- e.g. `NullTimerDriver`
    /// in tests).
    pub fn spawn(node: Node<S>, outputs: tokio::sync::mpsc::UnboundedSender<Output>) -> NodeHandle {
        let (handle, inbox) = node_channel();
        Self::spawn_with_inbox(node, inbox, outputs);
        handle
    }

    /// Spawn using a handle/inbox pair obtained from `node_channel` earlier,
    /// for the common case where `Node::new` needed the handle to build its
    /// `TokioTimerDriver` before the node existed.
    pub fn spawn_with_inbox(node: Node<S>, inbox: NodeInbox, outputs: tokio::sync::mpsc::UnboundedSender<Output>) {
        let actor = NodeActor { node, inbox: inbox.receiver, outputs };
        tokio::spawn(actor.run());
    }

    async fn run(mut self) {
        while let Some(ActorMessage::Input(input, reply)) = self.inbox.recv().await {
            let output = self.node.on_message(input);
            if let Some(reply) = reply {
                let _ = reply.send(output.clone());
            }
            let _ = self.outputs.send(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use crate::timer::NullTimerDriver;

    fn node(id: &str, peers: &[&str]) -> Node<InMemoryStore> {
        Node::new(
            NodeId::from(id),
            ClusterView::new(peers.iter().map(|p| NodeId::from(*p)).collect()),
            InMemoryStore::new(),
            Box::new(NullTimerDriver),
            Box::new(crate::observer::NoopObserver),
        )
    }

    // S1: a lone node with no peers becomes its own leader the moment its
    // election timer fires.
    #[test]
    fn solo_node_becomes_leader_immediately() {
        let mut a = node("a", &[]);
        let output = a.on_message(Input::Timer(TimerKind::ReceiveHeartbeatTimeout));
        assert_eq!(a.role_tag(), RoleTag::Leader);
        match output {
            Output::AddressedRequest(reqs) => assert!(reqs.is_empty()),
            other => panic!("expected an (empty) addressed request, got {other:?}"),
        }
    }

    // S2: a follower granting a vote, then the candidate winning a 3-node
    // election and broadcasting its first heartbeat.
    #[test]
    fn candidate_wins_election_with_majority_of_three() {
        let mut a = node("a", &["b", "c"]);
        let output = a.on_message(Input::Timer(TimerKind::ReceiveHeartbeatTimeout));
        assert_eq!(a.role_tag(), RoleTag::Candidate);
        let term = a.current_term();
        let requests = match output {
            Output::AddressedRequest(reqs) => reqs,
            other => panic!("expected RequestVote broadcast, got {other:?}"),
        };
        assert_eq!(requests.len(), 2);

        let out = a.on_message(Input::Message {
            from: NodeId::from("b"),
            message: RaftMessage::Response(RaftResponse::RequestVoteResponse { term, granted: true }),
        });
        assert_eq!(a.role_tag(), RoleTag::Leader);
        match out {
            Output::AddressedRequest(reqs) => assert_eq!(reqs.len(), 2),
            other => panic!("expected a heartbeat broadcast on becoming leader, got {other:?}"),
        }
    }

    // S3: a stale leader's AppendEntries at an old term is rejected and does
    // not disturb the current term or role.
    #[test]
    fn stale_leader_append_entries_is_rejected() {
        let mut b = node("b", &["a", "c"]);
        // bump b to term 2 by observing a higher-term message first.
        b.on_message(Input::Message {
            from: NodeId::from("a"),
            message: RaftMessage::Request(RaftRequest::AppendEntries {
                prev: LogCoords::EMPTY,
                term: 2,
                commit_index: 0,
                entries: vec![],
            }),
        });
        assert_eq!(b.current_term(), 2);

        let output = b.on_message(Input::Message {
            from: NodeId::from("a"),
            message: RaftMessage::Request(RaftRequest::AppendEntries {
                prev: LogCoords::EMPTY,
                term: 1,
                commit_index: 0,
                entries: vec![],
            }),
        });
        match output {
            Output::AddressedResponse(_, RaftResponse::AppendEntriesResponse { term, success, .. }) => {
                assert_eq!(term, 2);
                assert!(!success);
            }
            other => panic!("expected a rejected AppendEntriesResponse, got {other:?}"),
        }
        assert_eq!(b.current_term(), 2);
    }

    // S5: AppendData on a non-leader is refused without mutating anything.
    #[test]
    fn append_data_on_follower_is_refused() {
        let mut a = node("a", &["b", "c"]);
        let output = a.on_message(Input::AppendData(vec![b"hello".to_vec()]));
        match output {
            Output::NoOp(_) => {}
            other => panic!("expected NoOp, got {other:?}"),
        }
        assert_eq!(a.role_tag(), RoleTag::Follower);
    }

    #[test]
    fn leader_append_data_replicates_to_peers() {
        let mut a = node("a", &["b", "c"]);
        a.on_message(Input::Timer(TimerKind::ReceiveHeartbeatTimeout));
        let term = a.current_term();
        a.on_message(Input::Message {
            from: NodeId::from("b"),
            message: RaftMessage::Response(RaftResponse::RequestVoteResponse { term, granted: true }),
        });
        assert_eq!(a.role_tag(), RoleTag::Leader);

        let output = a.on_message(Input::AppendData(vec![b"command-1".to_vec()]));
        match output {
            Output::AppendAccepted { first, last, requests } => {
                assert_eq!(first, LogCoords { term, index: 1 });
                assert_eq!(last, LogCoords { term, index: 1 });
                assert_eq!(requests.len(), 2);
            }
            other => panic!("expected AppendAccepted, got {other:?}"),
        }
    }
}
