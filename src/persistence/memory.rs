use std::io;

use crate::ids::{NodeId, Term};

use super::PersistentStore;

/// Keeps term/vote in process memory only. Fine for tests and for nodes that
/// don't need to survive a restart; a real deployment wants `FileStore`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    term: Term,
    vote: Option<(Term, NodeId)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for InMemoryStore {
    fn load(&self) -> io::Result<(Term, Option<(Term, NodeId)>)> {
        Ok((self.term, self.vote.clone()))
    }

    fn save_term(&mut self, term: Term) -> io::Result<()> {
        self.term = term;
        Ok(())
    }

    fn save_vote(&mut self, term: Term, candidate: &NodeId) -> io::Result<()> {
        self.vote = Some((term, candidate.clone()));
        Ok(())
    }
}
