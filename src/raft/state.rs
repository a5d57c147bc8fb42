use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::raft::message::ConfigurationChangeType;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Payload carried by a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// No-op command (appended by a new leader so prior-term entries can commit)
    Noop,
    /// Opaque client command bytes
    Data(Vec<u8>),
    /// First half of a membership change: both sets must agree
    JointConfiguration {
        old: BTreeSet<u64>,
        new: BTreeSet<u64>,
    },
    /// Second half of a membership change: `members` takes sole effect on commit
    FinalConfiguration { members: BTreeSet<u64> },
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Where a node stands in a two-phase membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationPhase {
    None,
    /// Joint entry appended; old and new sets must both reach majority.
    Joint,
    /// Final entry appended, awaiting commit.
    Finalizing,
}

impl std::fmt::Display for ConfigurationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationPhase::None => write!(f, "none"),
            ConfigurationPhase::Joint => write!(f, "joint"),
            ConfigurationPhase::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// The single membership change a leader is driving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfigurationChange {
    pub change_type: ConfigurationChangeType,
    pub target_node_id: u64,
    /// Index of the joint-configuration entry.
    pub log_index: u64,
}

/// All state of one Raft node. Owned by the executor and mutated only by the
/// engine while the executor's gate is held.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`)
/// - Candidate must receive a quorum of `votes_granted`, counted per member set
///   during a membership change
///
/// ## Leader Append-Only
/// A leader never overwrites or deletes entries in its log. Enforced by:
/// - Leaders only append new entries via `append_entry()`
/// - Log truncation only occurs on followers during replication conflicts
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Only suffixes whose term differs are truncated; matching entries stay
///
/// ## Leader Completeness
/// If a log entry is committed in a given term, that entry will be present
/// in the logs of all leaders for higher terms. Enforced by:
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term
///
/// ## State Machine Safety
/// If a server has applied a log entry at a given index, no other server will
/// ever apply a different entry for that index. Enforced by:
/// - Entries are only applied after being committed (`last_applied <= commit_index`)
/// - Crash recovery resets `commit_index` to the snapshot boundary
#[derive(Debug, Clone)]
pub struct NodeState {
    pub node_id: u64,

    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Entries after the snapshot boundary, contiguous and 1-indexed.
    pub log: Vec<LogEntry>,

    // Compaction boundary
    pub snapshot_last_included_index: u64,
    pub snapshot_last_included_term: u64,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    pub role: RaftRole,
    pub leader_id: Option<u64>,
    pub votes_granted: BTreeSet<u64>,
    pub pre_votes_granted: BTreeSet<u64>,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Membership
    pub cluster_members: BTreeSet<u64>,
    pub configuration_phase: ConfigurationPhase,
    pub old_configuration_members: BTreeSet<u64>,
    pub new_configuration_members: BTreeSet<u64>,
    pub joint_configuration_index: Option<u64>,
    pub final_configuration_index: Option<u64>,
    pub pending_configuration_change: Option<PendingConfigurationChange>,
}

impl NodeState {
    /// # Panics
    ///
    /// Panics if `node_id` is 0 or `members` is empty; both are programming errors.
    pub fn new(node_id: u64, members: impl IntoIterator<Item = u64>) -> Self {
        let cluster_members: BTreeSet<u64> = members.into_iter().collect();
        assert!(node_id != 0, "node id 0 is reserved");
        assert!(!cluster_members.is_empty(), "member set must not be empty");

        Self {
            node_id,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot_last_included_index: 0,
            snapshot_last_included_term: 0,
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            votes_granted: BTreeSet::new(),
            pre_votes_granted: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            cluster_members,
            configuration_phase: ConfigurationPhase::None,
            old_configuration_members: BTreeSet::new(),
            new_configuration_members: BTreeSet::new(),
            joint_configuration_index: None,
            final_configuration_index: None,
            pending_configuration_change: None,
        }
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_last_included_index)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_included_term)
    }

    /// Get log entry at index (1-indexed). Compacted entries are `None`.
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_included_index {
            return None;
        }
        let offset = (index - self.snapshot_last_included_index - 1) as usize;
        self.log.get(offset)
    }

    /// Term of the entry at `index`, resolving the snapshot boundary.
    ///
    /// Returns `None` for indices that were compacted away or lie past the end
    /// of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_included_index {
            return Some(self.snapshot_last_included_term);
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get up to `max` entries starting from index (inclusive)
    pub fn get_entries_from(&self, start_index: u64, max: usize) -> Vec<LogEntry> {
        let first = self.snapshot_last_included_index + 1;
        let start = start_index.max(first);
        if start > self.last_log_index() {
            return Vec::new();
        }
        let offset = (start - first) as usize;
        self.log[offset..].iter().take(max).cloned().collect()
    }

    /// Entries in the inclusive range `from..=to`, skipping compacted ones.
    pub fn get_entries_between(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.get_entries_from(from, (to - from + 1) as usize)
    }

    /// First index at or after the snapshot boundary holding `term`, scanning
    /// backwards from `from_index`.
    pub fn first_index_of_term(&self, term: u64, from_index: u64) -> u64 {
        let mut index = from_index;
        while index > self.snapshot_last_included_index + 1 {
            match self.term_at(index - 1) {
                Some(t) if t == term => index -= 1,
                _ => break,
            }
        }
        index
    }

    /// Last index in the log carrying `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Append a new entry at the current term
    pub fn append_entry(&mut self, command: Command) -> LogEntry {
        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            command,
        };
        self.log.push(entry.clone());
        entry
    }

    /// Drop every entry at or after `from_index`.
    pub fn truncate_from(&mut self, from_index: u64) {
        let first = self.snapshot_last_included_index + 1;
        if from_index <= first {
            self.log.clear();
        } else {
            self.log.truncate((from_index - first) as usize);
        }
    }

    /// Move the snapshot boundary to `index`/`term`, discarding entries at or
    /// below it.
    pub fn compact_through(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_last_included_index {
            return;
        }
        let keep_from = self
            .log
            .iter()
            .position(|e| e.index > index)
            .unwrap_or(self.log.len());
        self.log.drain(..keep_from);
        self.snapshot_last_included_index = index;
        self.snapshot_last_included_term = term;
    }

    /// Track a configuration entry as soon as it is in the log, committed or not.
    pub fn track_configuration_entry(&mut self, entry: &LogEntry) {
        match &entry.command {
            Command::JointConfiguration { old, new } => {
                self.configuration_phase = ConfigurationPhase::Joint;
                self.old_configuration_members = old.clone();
                self.new_configuration_members = new.clone();
                self.joint_configuration_index = Some(entry.index);
                self.final_configuration_index = None;
            }
            Command::FinalConfiguration { members } => {
                if self.old_configuration_members.is_empty() {
                    self.old_configuration_members = self.cluster_members.clone();
                }
                self.configuration_phase = ConfigurationPhase::Finalizing;
                self.new_configuration_members = members.clone();
                self.final_configuration_index = Some(entry.index);
            }
            Command::Noop | Command::Data(_) => {}
        }
    }

    /// Forget any in-flight membership change.
    pub fn clear_configuration_transition(&mut self) {
        self.configuration_phase = ConfigurationPhase::None;
        self.old_configuration_members.clear();
        self.new_configuration_members.clear();
        self.joint_configuration_index = None;
        self.final_configuration_index = None;
        self.pending_configuration_change = None;
    }

    /// Rebuild the membership phase from the configuration entries still in
    /// the log, on top of `cluster_members`.
    pub fn reload_configuration_from_log(&mut self) {
        self.clear_configuration_transition();
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .filter(|e| {
                matches!(
                    e.command,
                    Command::JointConfiguration { .. } | Command::FinalConfiguration { .. }
                )
            })
            .cloned()
            .collect();
        for entry in &entries {
            self.track_configuration_entry(entry);
        }
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Adopt a newer term, forgetting the vote cast in the old one.
    pub fn advance_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    /// Transition to follower state, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        self.advance_term(term);
        self.role = RaftRole::Follower;
        self.votes_granted.clear();
        self.pre_votes_granted.clear();
        self.next_index.clear();
        self.match_index.clear();
        // Only a leader drives a change; the entries themselves stay tracked.
        self.pending_configuration_change = None;
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.votes_granted.clear();
        self.pre_votes_granted.clear();
        self.votes_granted.insert(self.node_id);
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id);
        self.votes_granted.clear();
        self.pre_votes_granted.clear();

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
        self.match_index.insert(self.node_id, last_log_index);
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}
