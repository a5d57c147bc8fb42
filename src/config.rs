use std::collections::BTreeSet;

use crate::error::{RaftError, Result};

/// Configuration for a single Raft node.
///
/// Timing values are consumed by the timer runtime (`RaftNode`); the
/// remaining knobs shape how the executor replicates and compacts.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: u64,
    /// Initial voting members, including this node.
    pub members: BTreeSet<u64>,
    /// Run a non-binding PreVote round before incrementing the term.
    pub pre_vote: bool,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single outbound RPC before it is treated as dropped.
    pub rpc_timeout_ms: u64,
    /// Take a snapshot once the in-memory log holds more entries than this.
    pub snapshot_threshold: usize,
    /// Ship a snapshot instead of entries once a follower trails the commit
    /// index by more than this many entries. 0 disables the heuristic.
    pub snapshot_lag_threshold: u64,
    /// Maximum number of entries carried by one AppendEntries request.
    pub max_append_entries: usize,
    /// Maximum nesting of replies fed back into the engine.
    pub max_reply_depth: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            members: BTreeSet::from([1]),
            pre_vote: true,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            snapshot_threshold: 1000,
            snapshot_lag_threshold: 500,
            max_append_entries: 64,
            max_reply_depth: 8,
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: u64, members: impl IntoIterator<Item = u64>) -> Self {
        Self {
            node_id,
            members: members.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_pre_vote(mut self, enabled: bool) -> Self {
        self.pre_vote = enabled;
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: usize) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_snapshot_lag_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_lag_threshold = threshold;
        self
    }

    pub fn with_max_append_entries(mut self, max: usize) -> Self {
        self.max_append_entries = max;
        self
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(RaftError::InvalidConfig("node id 0 is reserved".into()));
        }
        if self.members.is_empty() {
            return Err(RaftError::InvalidConfig("member set is empty".into()));
        }
        if self.members.contains(&0) {
            return Err(RaftError::InvalidConfig(
                "member set contains reserved node id 0".into(),
            ));
        }
        if !self.members.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} is not in the member set {:?}",
                self.node_id, self.members
            )));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_reply_depth == 0 {
            return Err(RaftError::InvalidConfig(
                "max reply depth must be at least 1".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::InvalidConfig(
                "max append entries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
