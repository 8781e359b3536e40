//! Durable storage for the two fields a node must never forget across a
//! restart: `current_term` and who it voted for in that term. This
//! generalizes the teacher's single `raft_state_<server_id>.bin` blob
//! (bincode of the whole `RaftState`) into a narrower contract -- only the
//! term/vote pair needs durability; the log and role are rebuilt from
//! replication traffic after a restart.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use std::io;

use crate::ids::{NodeId, Term};

/// Where a node's current term and vote get persisted. Implementations must
/// make `save_term`/`save_vote` durable before returning -- the caller
/// treats a successful save as having survived a crash.
pub trait PersistentStore: std::fmt::Debug + Send {
    /// Read back whatever was last durably saved. A store with nothing
    /// saved yet reports term 0 and no vote.
    fn load(&self) -> io::Result<(Term, Option<(Term, NodeId)>)>;

    fn save_term(&mut self, term: Term) -> io::Result<()>;

    fn save_vote(&mut self, term: Term, candidate: &NodeId) -> io::Result<()>;
}
