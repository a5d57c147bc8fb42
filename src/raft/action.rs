use std::collections::BTreeSet;

use crate::raft::message::Message;
use crate::raft::state::LogEntry;

/// Effects produced by the engine for the executor to perform.
///
/// Actions are transient: built by one `Engine::handle` call and consumed by
/// the executor before the gate is released. They are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Durably store term and vote before anything referencing them leaves the node.
    PersistState { term: u64, voted_for: Option<u64> },
    /// Append entries to the log store.
    PersistEntries(Vec<LogEntry>),
    /// Remove every stored entry at or after `from_index`.
    TruncateLogSuffix { from_index: u64 },
    /// Hand committed entries to the state machine.
    ApplyToStateMachine(Vec<LogEntry>),
    /// Install a snapshot received from the leader.
    TakeSnapshot {
        last_included_index: u64,
        last_included_term: u64,
        members: BTreeSet<u64>,
        data: Vec<u8>,
    },
    SendMessage { target: u64, message: Message },
    /// Replace AppendEntries with an InstallSnapshot exchange for `target`.
    SendSnapshotToPeer { target: u64 },
    ResetElectionTimer,
    ResetHeartbeatTimer,
}

impl Action {
    /// Persistence actions run before any apply/send/timer action of the same batch.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Action::PersistState { .. }
                | Action::PersistEntries(_)
                | Action::TruncateLogSuffix { .. }
                | Action::TakeSnapshot { .. }
        )
    }
}
