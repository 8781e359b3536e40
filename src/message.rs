//! Wire-level request/response bodies and the `Input`/`Output` shapes the
//! node's core loop consumes and produces.

use serde::{Deserialize, Serialize};

use crate::ids::{Index, NodeId, Term};
use crate::log::{LogCoords, LogEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ReceiveHeartbeatTimeout,
    SendHeartbeatTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries {
        prev: LogCoords,
        term: Term,
        commit_index: Index,
        entries: Vec<LogEntry>,
    },
    RequestVote {
        term: Term,
        last_log: LogCoords,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntriesResponse { term: Term, success: bool, match_index: Index },
    RequestVoteResponse { term: Term, granted: bool },
}

impl RaftRequest {
    pub fn term(&self) -> Term {
        match self {
            RaftRequest::AppendEntries { term, .. } => *term,
            RaftRequest::RequestVote { term, .. } => *term,
        }
    }
}

impl RaftResponse {
    pub fn term(&self) -> Term {
        match self {
            RaftResponse::AppendEntriesResponse { term, .. } => *term,
            RaftResponse::RequestVoteResponse { term, .. } => *term,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RaftMessage {
    Request(RaftRequest),
    Response(RaftResponse),
}

/// Everything that can drive the node's state machine forward.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Message { from: NodeId, message: RaftMessage },
    Timer(TimerKind),
    /// A client asking the (presumed) leader to replicate some opaque
    /// payloads. Each `Vec<u8>` becomes one log entry.
    AppendData(Vec<Vec<u8>>),
}

/// Everything `on_message` can ask the harness to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Nothing needs to go out over the network; `reason` is for logging.
    NoOp(String),
    /// Send each `RaftRequest` to the paired peer.
    AddressedRequest(Vec<(NodeId, RaftRequest)>),
    /// Send this `RaftResponse` back to whoever sent us the request.
    AddressedResponse(NodeId, RaftResponse),
    /// A client's `AppendData` was accepted into the local log (as leader).
    /// `first`/`last` bound the range just appended, and `requests` are the
    /// `AppendEntries` calls that now need to go out to replicate it.
    AppendAccepted {
        first: LogCoords,
        last: LogCoords,
        requests: Vec<(NodeId, RaftRequest)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTag {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChangeEvent {
    pub term: Term,
    pub old_role: RoleTag,
    pub new_role: RoleTag,
}
