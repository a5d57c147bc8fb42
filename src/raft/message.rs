//! Wire and timer vocabulary shared by the engine and the executor.
//!
//! Messages are immutable once built: created once, consumed once. Framing
//! and encoding are the transport's concern; the serde derives only make
//! every payload encodable.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationChangeType {
    AddNode,
    RemoveNode,
}

impl std::fmt::Display for ConfigurationChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationChangeType::AddNode => write!(f, "add"),
            ConfigurationChangeType::RemoveNode => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// For a PreVote this is the candidate's `current_term + 1`.
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub is_pre_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub from: u64,
    pub vote_granted: bool,
    pub is_pre_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub from: u64,
    pub success: bool,
    /// Highest index known to match the leader on success.
    pub match_index: u64,
    /// Term of the conflicting entry, when the follower holds one.
    pub conflict_term: Option<u64>,
    /// First index the leader should retry from.
    pub conflict_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Member set in effect at the snapshot boundary.
    pub members: BTreeSet<u64>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub from: u64,
    pub last_included_index: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCommandResponse {
    pub success: bool,
    pub index: Option<u64>,
    pub term: u64,
    pub leader_hint: Option<u64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadIndexResponse {
    pub success: bool,
    pub read_index: u64,
    pub term: u64,
    pub leader_hint: Option<u64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChangeRequest {
    pub change_type: ConfigurationChangeType,
    pub target_node_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChangeResponse {
    pub success: bool,
    /// True once the final configuration has committed.
    pub committed: bool,
    /// Index of the joint-configuration entry to watch.
    pub log_index: Option<u64>,
    pub leader_hint: Option<u64>,
    pub reason: Option<String>,
}

impl ConfigurationChangeResponse {
    pub fn rejected(reason: impl Into<String>, leader_hint: Option<u64>) -> Self {
        Self {
            success: false,
            committed: false,
            log_index: None,
            leader_hint,
            reason: Some(reason.into()),
        }
    }
}

/// Every input the engine understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    ElectionTimeoutElapsed,
    HeartbeatTimeoutElapsed,
    ClientCommandRequest(Vec<u8>),
    ClientCommandResponse(ClientCommandResponse),
    ReadIndexRequest,
    ReadIndexResponse(ReadIndexResponse),
    ConfigurationChangeRequest(ConfigurationChangeRequest),
    ConfigurationChangeResponse(ConfigurationChangeResponse),
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    /// Term carried by peer-to-peer messages.
    pub fn term(&self) -> Option<u64> {
        match self {
            Message::RequestVoteRequest(m) => Some(m.term),
            Message::RequestVoteResponse(m) => Some(m.term),
            Message::AppendEntriesRequest(m) => Some(m.term),
            Message::AppendEntriesResponse(m) => Some(m.term),
            Message::InstallSnapshotRequest(m) => Some(m.term),
            Message::InstallSnapshotResponse(m) => Some(m.term),
            _ => None,
        }
    }

    /// Node that sent a peer-to-peer message.
    pub fn sender(&self) -> Option<u64> {
        match self {
            Message::RequestVoteRequest(m) => Some(m.candidate_id),
            Message::RequestVoteResponse(m) => Some(m.from),
            Message::AppendEntriesRequest(m) => Some(m.leader_id),
            Message::AppendEntriesResponse(m) => Some(m.from),
            Message::InstallSnapshotRequest(m) => Some(m.leader_id),
            Message::InstallSnapshotResponse(m) => Some(m.from),
            _ => None,
        }
    }

    /// Whether this message answers an earlier request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::ClientCommandResponse(_)
                | Message::ReadIndexResponse(_)
                | Message::ConfigurationChangeResponse(_)
                | Message::RequestVoteResponse(_)
                | Message::AppendEntriesResponse(_)
                | Message::InstallSnapshotResponse(_)
        )
    }

    /// Whether this message originates from a local client rather than a peer
    /// or a timer.
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            Message::ClientCommandRequest(_)
                | Message::ReadIndexRequest
                | Message::ConfigurationChangeRequest(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::ElectionTimeoutElapsed => "ElectionTimeoutElapsed",
            Message::HeartbeatTimeoutElapsed => "HeartbeatTimeoutElapsed",
            Message::ClientCommandRequest(_) => "ClientCommandRequest",
            Message::ClientCommandResponse(_) => "ClientCommandResponse",
            Message::ReadIndexRequest => "ReadIndexRequest",
            Message::ReadIndexResponse(_) => "ReadIndexResponse",
            Message::ConfigurationChangeRequest(_) => "ConfigurationChangeRequest",
            Message::ConfigurationChangeResponse(_) => "ConfigurationChangeResponse",
            Message::RequestVoteRequest(_) => "RequestVoteRequest",
            Message::RequestVoteResponse(_) => "RequestVoteResponse",
            Message::AppendEntriesRequest(_) => "AppendEntriesRequest",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::InstallSnapshotRequest(_) => "InstallSnapshotRequest",
            Message::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
        }
    }
}
