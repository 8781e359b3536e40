//! Callbacks a harness can hook to watch a node's progress without reaching
//! into its internals. Default no-ops, same shape as the teacher's ad hoc
//! `info!`/`println!` call sites scattered through `raft.rs`, but pulled out
//! into one seam.

use crate::ids::NodeId;
use crate::log::{LogCoords, LogEntry};
use crate::message::RoleChangeEvent;

pub trait NodeObserver: Send {
    fn on_role_change(&mut self, _event: RoleChangeEvent) {}
    fn on_new_leader(&mut self, _leader: NodeId) {}
    fn on_committed(&mut self, _entries: &[(LogCoords, LogEntry)]) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl NodeObserver for NoopObserver {}

#[derive(Debug)]
pub struct LoggingObserver {
    node_id: NodeId,
}

impl LoggingObserver {
    pub fn new(node_id: NodeId) -> Self {
        LoggingObserver { node_id }
    }
}

impl NodeObserver for LoggingObserver {
    fn on_role_change(&mut self, event: RoleChangeEvent) {
        log::info!(
            "[{}] term {}: {:?} -> {:?}",
            self.node_id,
            event.term,
            event.old_role,
            event.new_role
        );
    }

    fn on_new_leader(&mut self, leader: NodeId) {
        log::info!("[{}] new leader: {}", self.node_id, leader);
    }

    fn on_committed(&mut self, entries: &[(LogCoords, LogEntry)]) {
        for (coords, entry) in entries {
            log::debug!("[{}] committed {:?} ({} bytes)", self.node_id, coords, entry.data.len());
        }
    }
}
