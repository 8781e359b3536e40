//! A single-node Raft consensus state machine: a deterministic core
//! (`Node::on_message`) plus the ambient stack around it -- durable
//! term/vote state, an injectable timer, a length-prefixed JSON transport,
//! and a CLI to run it all as a server.

pub mod cluster;
pub mod ids;
pub mod log;
pub mod message;
pub mod node;
pub mod observer;
pub mod persistence;
pub mod persistent_state;
pub mod role;
pub mod timer;
pub mod transport;

pub use cluster::ClusterView;
pub use ids::{Index, NodeId, Term};
pub use log::{AppendResult, Log, LogAppendError, LogCoords, LogEntry};
pub use message::{Input, Output, RaftMessage, RaftRequest, RaftResponse, RoleChangeEvent, RoleTag, TimerKind};
pub use node::{node_channel, Node, NodeActor, NodeHandle, NodeInbox};
pub use observer::{LoggingObserver, NodeObserver, NoopObserver};
pub use persistence::{FileStore, InMemoryStore, PersistentStore};
pub use persistent_state::{PersistentState, RequestVoteReply, RequestVoteRequest};
pub use role::{CandidateState, FollowerState, LeaderResult, LeaderState, NodeRole, Peer, VoteOutcome};
pub use timer::{InputSink, NullTimerDriver, SimulatedTimerDriver, TimerDriver, TimerHandle, TokioTimerDriver, VirtualClock};
pub use transport::{connect_and_send_request, RaftServer};
