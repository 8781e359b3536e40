//! The term/vote half of a node's state: the part that must survive a
//! restart and that enforces "at most one vote per term".

use crate::ids::{NodeId, Term};
use crate::log::LogCoords;
use crate::persistence::PersistentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub last_log: LogCoords,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteReply {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug)]
pub struct PersistentState<S: PersistentStore> {
    store: S,
    current_term: Term,
    voted_for: Option<(Term, NodeId)>,
}

impl<S: PersistentStore> PersistentState<S> {
    pub fn load(store: S) -> Self {
        let (current_term, voted_for) = store.load().expect("persistent store must be readable at startup");
        PersistentState { store, current_term, voted_for }
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Bump to a higher term observed on the wire, clearing any vote cast
    /// under the old term. No-op (returns false) if `term` isn't actually
    /// higher -- terms only move forward.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.store.save_term(term).expect("persisting current_term must not fail");
        true
    }

    /// Start a new election: bump the term and record a self-vote.
    /// Returns the new term.
    pub fn begin_election(&mut self, self_id: NodeId) -> Term {
        self.current_term += 1;
        self.voted_for = Some((self.current_term, self_id.clone()));
        self.store.save_term(self.current_term).expect("persisting current_term must not fail");
        self.store
            .save_vote(self.current_term, &self_id)
            .expect("persisting voted_for must not fail");
        self.current_term
    }

    /// Decide a `RequestVote` per the usual rules: reject stale terms,
    /// bump to a higher term first, refuse a second vote for a different
    /// candidate in the same term, and require the candidate's log to be at
    /// least as up to date as ours.
    pub fn cast_vote(&mut self, local: LogCoords, from: NodeId, req: RequestVoteRequest) -> RequestVoteReply {
        if req.term < self.current_term {
            return RequestVoteReply { term: self.current_term, granted: false };
        }
        if req.term > self.current_term {
            self.observe_term(req.term);
        }

        if let Some((term, holder)) = &self.voted_for {
            if *term == req.term && *holder != from {
                return RequestVoteReply { term: self.current_term, granted: false };
            }
        }

        let up_to_date = req.last_log.term > local.term
            || (req.last_log.term == local.term && req.last_log.index >= local.index);
        if !up_to_date {
            return RequestVoteReply { term: self.current_term, granted: false };
        }

        let already_recorded =
            matches!(&self.voted_for, Some((term, holder)) if *term == req.term && *holder == from);
        if !already_recorded {
            debug_assert!(
                !matches!(&self.voted_for, Some((term, holder)) if *term == req.term && *holder != from),
                "must never grant a second vote to a different candidate in the same term"
            );
            self.voted_for = Some((req.term, from.clone()));
            self.store
                .save_vote(req.term, &from)
                .expect("persisting voted_for must not fail");
        }

        RequestVoteReply { term: self.current_term, granted: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;

    #[test]
    fn grants_vote_for_an_up_to_date_candidate() {
        let mut state = PersistentState::load(InMemoryStore::new());
        let reply = state.cast_vote(
            LogCoords::EMPTY,
            NodeId::from("a"),
            RequestVoteRequest { term: 1, last_log: LogCoords::EMPTY },
        );
        assert!(reply.granted);
        assert_eq!(state.current_term(), 1);
    }

    #[test]
    fn refuses_a_second_vote_in_the_same_term() {
        let mut state = PersistentState::load(InMemoryStore::new());
        state.cast_vote(LogCoords::EMPTY, NodeId::from("a"), RequestVoteRequest { term: 1, last_log: LogCoords::EMPTY });
        let reply = state.cast_vote(LogCoords::EMPTY, NodeId::from("b"), RequestVoteRequest { term: 1, last_log: LogCoords::EMPTY });
        assert!(!reply.granted);
    }

    #[test]
    fn rereplying_the_same_candidate_is_idempotent() {
        let mut state = PersistentState::load(InMemoryStore::new());
        state.cast_vote(LogCoords::EMPTY, NodeId::from("a"), RequestVoteRequest { term: 1, last_log: LogCoords::EMPTY });
        let reply = state.cast_vote(LogCoords::EMPTY, NodeId::from("a"), RequestVoteRequest { term: 1, last_log: LogCoords::EMPTY });
        assert!(reply.granted);
    }

    #[test]
    fn refuses_a_candidate_with_a_stale_log() {
        let mut state = PersistentState::load(InMemoryStore::new());
        let local = LogCoords { term: 3, index: 10 };
        let reply = state.cast_vote(
            local,
            NodeId::from("a"),
            RequestVoteRequest { term: 4, last_log: LogCoords { term: 2, index: 20 } },
        );
        assert!(!reply.granted);
    }

    #[test]
    fn rejects_a_stale_term_request() {
        let mut state = PersistentState::load(InMemoryStore::new());
        state.observe_term(5);
        let reply = state.cast_vote(LogCoords::EMPTY, NodeId::from("a"), RequestVoteRequest { term: 3, last_log: LogCoords::EMPTY });
        assert!(!reply.granted);
        assert_eq!(reply.term, 5);
    }
}
