//! Deterministic, single-threaded cluster simulation: several `Node`s wired
//! through an in-memory queue instead of real sockets, with timers fired by
//! hand instead of a clock. This is the "simulated-time integration harness"
//! the core is required to be testable under -- the same input sequence
//! always produces the same sequence of outputs, with no sleeping involved.

use std::collections::{HashMap, HashSet, VecDeque};

use raft_node::{
    ClusterView, InMemoryStore, Index, Input, NoopObserver, Node, NodeId, NullTimerDriver, Output, RaftMessage, RoleTag,
    Term, TimerKind,
};

/// A tiny deterministic network: nodes are driven one input at a time, and
/// whatever requests/responses an input produces are queued for delivery
/// rather than sent over a socket. `drain` delivers messages until the
/// queue runs dry, exactly mirroring how a real transport would eventually
/// settle given no further external input.
struct Cluster {
    nodes: HashMap<NodeId, Node<InMemoryStore>>,
    queue: VecDeque<(NodeId, NodeId, RaftMessage)>,
    partitioned: HashSet<NodeId>,
}

impl Cluster {
    fn new(ids: &[&str]) -> Self {
        let mut nodes = HashMap::new();
        for id in ids {
            let peers = ids.iter().filter(|p| **p != *id).map(|p| NodeId::from(*p)).collect();
            let node = Node::new(
                NodeId::from(*id),
                ClusterView::new(peers),
                InMemoryStore::new(),
                Box::new(NullTimerDriver),
                Box::new(NoopObserver),
            );
            nodes.insert(NodeId::from(*id), node);
        }
        Cluster { nodes, queue: VecDeque::new(), partitioned: HashSet::new() }
    }

    fn partition(&mut self, id: &str) {
        self.partitioned.insert(NodeId::from(id));
    }

    fn heal(&mut self, id: &str) {
        self.partitioned.remove(&NodeId::from(id));
    }

    fn fire_timer(&mut self, id: &str, kind: TimerKind) {
        let from = NodeId::from(id);
        let output = self.nodes.get_mut(&from).unwrap().on_message(Input::Timer(kind));
        self.route(from, output);
    }

    fn append_data(&mut self, id: &str, data: Vec<Vec<u8>>) -> Output {
        let from = NodeId::from(id);
        let output = self.nodes.get_mut(&from).unwrap().on_message(Input::AppendData(data));
        self.route(from, output.clone());
        output
    }

    fn route(&mut self, from: NodeId, output: Output) {
        match output {
            Output::AddressedRequest(reqs) => {
                for (to, req) in reqs {
                    if self.partitioned.contains(&from) || self.partitioned.contains(&to) {
                        continue;
                    }
                    self.queue.push_back((from.clone(), to, RaftMessage::Request(req)));
                }
            }
            Output::AddressedResponse(to, resp) => {
                if !(self.partitioned.contains(&from) || self.partitioned.contains(&to)) {
                    self.queue.push_back((from, to, RaftMessage::Response(resp)));
                }
            }
            Output::AppendAccepted { requests, .. } => {
                for (to, req) in requests {
                    if self.partitioned.contains(&from) || self.partitioned.contains(&to) {
                        continue;
                    }
                    self.queue.push_back((from.clone(), to, RaftMessage::Request(req)));
                }
            }
            Output::NoOp(_) => {}
        }
    }

    /// Deliver every queued message, routing whatever each delivery produces
    /// back onto the queue, until nothing is left in flight.
    fn drain(&mut self) {
        while let Some((from, to, message)) = self.queue.pop_front() {
            if self.partitioned.contains(&from) || self.partitioned.contains(&to) {
                continue;
            }
            let output = self.nodes.get_mut(&to).unwrap().on_message(Input::Message { from, message });
            self.route(to, output);
        }
    }

    fn role(&self, id: &str) -> RoleTag {
        self.nodes.get(&NodeId::from(id)).unwrap().role_tag()
    }

    fn term(&self, id: &str) -> Term {
        self.nodes.get(&NodeId::from(id)).unwrap().current_term()
    }

    fn commit(&self, id: &str) -> Index {
        self.nodes.get(&NodeId::from(id)).unwrap().latest_commit()
    }

    fn leader(&self, id: &str) -> Option<NodeId> {
        self.nodes.get(&NodeId::from(id)).unwrap().leader()
    }
}

// S1: three-node election -- a fires its receive-heartbeat timeout, wins
// unanimously, and both followers end up agreeing on the new term and
// leader.
#[test]
fn three_node_election() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();

    assert_eq!(cluster.role("a"), RoleTag::Leader);
    assert_eq!(cluster.role("b"), RoleTag::Follower);
    assert_eq!(cluster.role("c"), RoleTag::Follower);
    assert_eq!(cluster.term("a"), 1);
    assert_eq!(cluster.term("b"), 1);
    assert_eq!(cluster.term("c"), 1);
    assert_eq!(cluster.leader("b"), Some(NodeId::from("a")));
    assert_eq!(cluster.leader("c"), Some(NodeId::from("a")));
}

// S2: a client append on the freshly elected leader replicates to both
// followers and, once their acks land, advances the leader's commit index.
// Followers only learn about the new commit index on the next heartbeat.
#[test]
fn client_append_commits_after_quorum_then_propagates_on_heartbeat() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();

    cluster.append_data("a", vec![b"x".to_vec()]);
    cluster.drain();

    assert_eq!(cluster.commit("a"), 1);
    assert_eq!(cluster.commit("b"), 0);
    assert_eq!(cluster.commit("c"), 0);

    cluster.fire_timer("a", TimerKind::SendHeartbeatTimeout);
    cluster.drain();

    assert_eq!(cluster.commit("b"), 1);
    assert_eq!(cluster.commit("c"), 1);
}

// Boundary: a two-node cluster needs exactly one peer vote (plus the
// candidate's own) to reach a majority of two.
#[test]
fn two_node_cluster_wins_with_a_single_peer_vote() {
    let mut cluster = Cluster::new(&["a", "b"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();
    assert_eq!(cluster.role("a"), RoleTag::Leader);
}

// Boundary: an empty cluster becomes its own leader in one tick, with no
// outbound traffic at all.
#[test]
fn solo_cluster_elects_immediately() {
    let mut cluster = Cluster::new(&["a"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();
    assert_eq!(cluster.role("a"), RoleTag::Leader);
    assert_eq!(cluster.term("a"), 1);
}

// A follower that misses a whole run of entries (partitioned out, so it
// never even sees the requests) falls behind the leader's next_index
// bookkeeping: the leader optimistically advanced next_index for it on
// every send regardless of delivery. Once healed, the first new entry it's
// asked to append conflicts (`skip`, since it's missing everything before
// it); the leader walks next_index back down one rejection at a time until
// it finds common ground, then resends the whole backlog in one shot.
#[test]
fn partitioned_follower_catches_up_via_next_index_backoff() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();
    assert_eq!(cluster.role("a"), RoleTag::Leader);

    cluster.partition("c");
    for word in ["one", "two", "three"] {
        cluster.append_data("a", vec![word.as_bytes().to_vec()]);
        cluster.drain();
    }
    assert_eq!(cluster.commit("a"), 3);
    assert_eq!(cluster.nodes[&NodeId::from("c")].latest_appended().index, 0);

    cluster.heal("c");
    cluster.append_data("a", vec![b"four".to_vec()]);
    cluster.drain();

    assert_eq!(cluster.nodes[&NodeId::from("c")].latest_appended(), cluster.nodes[&NodeId::from("a")].latest_appended());
    assert_eq!(cluster.nodes[&NodeId::from("c")].latest_appended().index, 4);
}

// S3-shaped scenario at the integration level: a leader that has been
// partitioned away from the rest of the cluster steps down the moment it
// hears back from a node that has moved on to a higher term.
#[test]
fn stale_leader_steps_down_on_contact_with_higher_term() {
    let mut cluster = Cluster::new(&["a", "b", "c"]);
    cluster.fire_timer("a", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();
    assert_eq!(cluster.role("a"), RoleTag::Leader);
    assert_eq!(cluster.term("a"), 1);

    // a is partitioned away; b and c elect a new leader at term 2.
    cluster.partition("a");
    cluster.fire_timer("b", TimerKind::ReceiveHeartbeatTimeout);
    cluster.drain();
    assert_eq!(cluster.role("b"), RoleTag::Leader);
    assert_eq!(cluster.term("b"), 2);

    // a reconnects and tries to replicate at its stale term; b's rejection
    // carries term 2, which bumps a back to Follower.
    cluster.heal("a");
    cluster.fire_timer("a", TimerKind::SendHeartbeatTimeout);
    cluster.drain();

    assert_eq!(cluster.role("a"), RoleTag::Follower);
    assert_eq!(cluster.term("a"), 2);
}
