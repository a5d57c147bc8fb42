//! The pure Raft state-transition function.
//!
//! `Engine::handle` takes the node state and one inbound message, mutates the
//! state in place and returns the ordered effects the executor must carry
//! out. It performs no I/O, reads no clock and draws no random numbers, so
//! every transition can be replayed and tested in isolation.

use std::cmp::{max, min};

use crate::config::RaftConfig;
use crate::raft::action::Action;
use crate::raft::membership;
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, ClientCommandResponse, ConfigurationChangeRequest,
    ConfigurationChangeResponse, ConfigurationChangeType, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, ReadIndexResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::state::{
    Command, ConfigurationPhase, LogEntry, NodeState, PendingConfigurationChange, RaftRole,
};

/// Smallest cluster a removal may leave behind.
const MIN_CLUSTER_SIZE_AFTER_REMOVAL: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pre_vote: bool,
    pub max_append_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pre_vote: true,
            max_append_entries: 64,
        }
    }
}

impl From<&RaftConfig> for EngineConfig {
    fn from(config: &RaftConfig) -> Self {
        Self {
            pre_vote: config.pre_vote,
            max_append_entries: config.max_append_entries,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply one message to `state` and return the effects to perform.
    ///
    /// A `PersistState` action is emitted first whenever term or vote changed.
    pub fn handle(&self, state: &mut NodeState, message: Message) -> Vec<Action> {
        let before = (state.current_term, state.voted_for);
        let mut actions = Vec::new();

        self.apply_term_rule(state, &message);

        match message {
            Message::ElectionTimeoutElapsed => self.on_election_timeout(state, &mut actions),
            Message::HeartbeatTimeoutElapsed => self.on_heartbeat_timeout(state, &mut actions),
            Message::ClientCommandRequest(data) => {
                self.on_client_command(state, data, &mut actions)
            }
            Message::ReadIndexRequest => self.on_read_index(state, &mut actions),
            Message::ConfigurationChangeRequest(req) => {
                self.on_configuration_change(state, req, &mut actions)
            }
            Message::RequestVoteRequest(req) => self.on_request_vote(state, req, &mut actions),
            Message::RequestVoteResponse(resp) => {
                self.on_request_vote_response(state, resp, &mut actions)
            }
            Message::AppendEntriesRequest(req) => {
                self.on_append_entries(state, req, &mut actions)
            }
            Message::AppendEntriesResponse(resp) => {
                self.on_append_entries_response(state, resp, &mut actions)
            }
            Message::InstallSnapshotRequest(req) => {
                self.on_install_snapshot(state, req, &mut actions)
            }
            Message::InstallSnapshotResponse(resp) => {
                self.on_install_snapshot_response(state, resp, &mut actions)
            }
            Message::ClientCommandResponse(_)
            | Message::ReadIndexResponse(_)
            | Message::ConfigurationChangeResponse(_) => {}
        }

        if (state.current_term, state.voted_for) != before {
            actions.insert(
                0,
                Action::PersistState {
                    term: state.current_term,
                    voted_for: state.voted_for,
                },
            );
        }

        actions
    }

    /// Any newer term forces a step-down, except a PreVote request which
    /// carries a speculative `term + 1` and a vote request from a node
    /// outside the voting set.
    fn apply_term_rule(&self, state: &mut NodeState, message: &Message) {
        let Some(term) = message.term() else {
            return;
        };
        if term <= state.current_term {
            return;
        }
        if let Message::RequestVoteRequest(req) = message {
            if req.is_pre_vote || !membership::voting_members(state).contains(&req.candidate_id) {
                return;
            }
        }

        tracing::debug!(
            node_id = state.node_id,
            old_term = state.current_term,
            new_term = term,
            message = message.name(),
            "Observed newer term, stepping down"
        );
        if state.is_leader() {
            tracing::info!(node_id = state.node_id, term, "Leader stepping down");
        }
        state.become_follower(term);
        state.leader_id = None;
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    fn on_election_timeout(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        if state.is_leader() {
            return;
        }
        if !membership::voting_members(state).contains(&state.node_id) {
            tracing::debug!(
                node_id = state.node_id,
                "Not a voting member, ignoring election timeout"
            );
            return;
        }
        // The leader stops replicating to a removed node once the final
        // entry commits, so the node may never see that commit.
        if state.configuration_phase == ConfigurationPhase::Finalizing
            && !state.new_configuration_members.contains(&state.node_id)
        {
            tracing::debug!(
                node_id = state.node_id,
                "Removed by pending final configuration, ignoring election timeout"
            );
            return;
        }

        state.leader_id = None;
        state.votes_granted.clear();
        state.pre_votes_granted.clear();

        if !self.config.pre_vote {
            self.start_election(state, actions);
            return;
        }

        if state.role == RaftRole::Candidate {
            // Retreat and campaign again through a PreVote round.
            state.role = RaftRole::Follower;
        }
        state.pre_votes_granted.insert(state.node_id);
        actions.push(Action::ResetElectionTimer);

        if membership::has_quorum(state, &state.pre_votes_granted) {
            self.start_election(state, actions);
            return;
        }

        tracing::debug!(
            node_id = state.node_id,
            term = state.current_term + 1,
            "Starting pre-vote"
        );
        let req = RequestVoteRequest {
            term: state.current_term + 1,
            candidate_id: state.node_id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
            is_pre_vote: true,
        };
        for peer in membership::peers(state) {
            actions.push(Action::SendMessage {
                target: peer,
                message: Message::RequestVoteRequest(req.clone()),
            });
        }
    }

    fn start_election(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        state.become_candidate();
        tracing::info!(
            node_id = state.node_id,
            term = state.current_term,
            "Starting election"
        );
        actions.push(Action::ResetElectionTimer);

        if membership::has_quorum(state, &state.votes_granted) {
            self.become_leader(state, actions);
            return;
        }

        let req = RequestVoteRequest {
            term: state.current_term,
            candidate_id: state.node_id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
            is_pre_vote: false,
        };
        for peer in membership::peers(state) {
            actions.push(Action::SendMessage {
                target: peer,
                message: Message::RequestVoteRequest(req.clone()),
            });
        }
    }

    fn on_request_vote(
        &self,
        state: &mut NodeState,
        req: RequestVoteRequest,
        actions: &mut Vec<Action>,
    ) {
        let vote_granted = if !membership::voting_members(state).contains(&req.candidate_id) {
            false
        } else if req.is_pre_vote {
            // Non-binding: judged against the speculative term, no vote recorded.
            req.term > state.current_term
                && !state.is_leader()
                && state.leader_id.is_none()
                && state.is_log_up_to_date(req.last_log_index, req.last_log_term)
        } else if req.term < state.current_term {
            false
        } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
            false
        } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
            false
        } else {
            state.voted_for = Some(req.candidate_id);
            actions.push(Action::ResetElectionTimer);
            true
        };

        tracing::debug!(
            node_id = state.node_id,
            candidate = req.candidate_id,
            term = req.term,
            pre_vote = req.is_pre_vote,
            granted = vote_granted,
            "RequestVote response"
        );

        actions.push(Action::SendMessage {
            target: req.candidate_id,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: state.current_term,
                from: state.node_id,
                vote_granted,
                is_pre_vote: req.is_pre_vote,
            }),
        });
    }

    fn on_request_vote_response(
        &self,
        state: &mut NodeState,
        resp: RequestVoteResponse,
        actions: &mut Vec<Action>,
    ) {
        if resp.is_pre_vote {
            // Only a follower with an open pre-vote round counts grants.
            if state.role != RaftRole::Follower
                || state.pre_votes_granted.is_empty()
                || !resp.vote_granted
            {
                return;
            }
            state.pre_votes_granted.insert(resp.from);
            if membership::has_quorum(state, &state.pre_votes_granted) {
                tracing::debug!(
                    node_id = state.node_id,
                    granted = state.pre_votes_granted.len(),
                    "Pre-vote succeeded"
                );
                self.start_election(state, actions);
            }
            return;
        }

        if state.role != RaftRole::Candidate || resp.term != state.current_term {
            return;
        }
        if !resp.vote_granted {
            return;
        }
        state.votes_granted.insert(resp.from);
        tracing::debug!(
            node_id = state.node_id,
            peer_id = resp.from,
            votes = state.votes_granted.len(),
            "Received vote"
        );
        if membership::has_quorum(state, &state.votes_granted) {
            self.become_leader(state, actions);
        }
    }

    fn become_leader(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        let peers = membership::peers(state);
        state.become_leader(&peers);
        tracing::info!(
            node_id = state.node_id,
            term = state.current_term,
            "Became leader"
        );

        let noop = self.leader_append(state, Command::Noop);
        actions.push(Action::PersistEntries(vec![noop]));
        self.advance_commit_index(state, actions);
        self.broadcast_append_entries(state, actions);
        actions.push(Action::ResetHeartbeatTimer);
    }

    // ---------------------------------------------------------------------
    // Replication (leader side)
    // ---------------------------------------------------------------------

    fn on_heartbeat_timeout(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        if !state.is_leader() {
            return;
        }
        self.broadcast_append_entries(state, actions);
        actions.push(Action::ResetHeartbeatTimer);
    }

    fn broadcast_append_entries(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        for peer in membership::peers(state) {
            self.replicate_to(state, peer, actions);
        }
    }

    /// Emit the next AppendEntries for `peer`, or redirect to a snapshot when
    /// the entries it needs were compacted.
    fn replicate_to(&self, state: &mut NodeState, peer: u64, actions: &mut Vec<Action>) {
        let last_log_index = state.last_log_index();
        let next = state
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last_log_index + 1)
            .clamp(1, last_log_index + 1);
        state.next_index.insert(peer, next);
        state.match_index.entry(peer).or_insert(0);

        let prev_log_index = next - 1;
        if prev_log_index < state.snapshot_last_included_index {
            actions.push(Action::SendSnapshotToPeer { target: peer });
            return;
        }

        let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
        let entries = state.get_entries_from(next, self.config.max_append_entries);
        actions.push(Action::SendMessage {
            target: peer,
            message: Message::AppendEntriesRequest(AppendEntriesRequest {
                term: state.current_term,
                leader_id: state.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            }),
        });
    }

    fn on_append_entries_response(
        &self,
        state: &mut NodeState,
        resp: AppendEntriesResponse,
        actions: &mut Vec<Action>,
    ) {
        if !state.is_leader() || resp.term < state.current_term {
            return;
        }
        let peer = resp.from;
        if peer == state.node_id {
            return;
        }

        if resp.success {
            let matched = max(
                state.match_index.get(&peer).copied().unwrap_or(0),
                resp.match_index,
            );
            state.match_index.insert(peer, matched);
            let next = max(
                state.next_index.get(&peer).copied().unwrap_or(0),
                matched + 1,
            );
            state.next_index.insert(peer, next);

            let appended_configuration = self.advance_commit_index(state, actions);
            if appended_configuration {
                self.broadcast_append_entries(state, actions);
            } else if next <= state.last_log_index() {
                self.replicate_to(state, peer, actions);
            }
            return;
        }

        let current_next = state
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(state.last_log_index() + 1);
        let backed_off = match (resp.conflict_term, resp.conflict_index) {
            (Some(term), Some(index)) => state
                .last_index_of_term(term)
                .map(|last| last + 1)
                .unwrap_or(index),
            (None, Some(index)) => index,
            _ => current_next.saturating_sub(1),
        };
        let floor = state.match_index.get(&peer).copied().unwrap_or(0) + 1;
        let next = backed_off.clamp(floor, state.last_log_index() + 1);
        tracing::debug!(
            node_id = state.node_id,
            peer_id = peer,
            conflict_term = ?resp.conflict_term,
            conflict_index = ?resp.conflict_index,
            next_index = next,
            "AppendEntries rejected, backing off"
        );
        state.next_index.insert(peer, next);
        self.replicate_to(state, peer, actions);
    }

    fn on_install_snapshot_response(
        &self,
        state: &mut NodeState,
        resp: InstallSnapshotResponse,
        actions: &mut Vec<Action>,
    ) {
        if !state.is_leader() || resp.term < state.current_term || !resp.success {
            return;
        }
        let peer = resp.from;
        let matched = max(
            state.match_index.get(&peer).copied().unwrap_or(0),
            resp.last_included_index,
        );
        state.match_index.insert(peer, matched);
        state.next_index.insert(peer, matched + 1);
        tracing::debug!(
            node_id = state.node_id,
            peer_id = peer,
            match_index = matched,
            "Snapshot installed on peer"
        );

        if self.advance_commit_index(state, actions) {
            self.broadcast_append_entries(state, actions);
        } else if matched < state.last_log_index() {
            self.replicate_to(state, peer, actions);
        }
    }

    /// Append on the leader and count its own copy toward the quorum.
    fn leader_append(&self, state: &mut NodeState, command: Command) -> LogEntry {
        let entry = state.append_entry(command);
        state.track_configuration_entry(&entry);
        state.match_index.insert(state.node_id, entry.index);
        entry
    }

    /// Commit the highest current-term index replicated by a quorum.
    ///
    /// Returns true when a configuration entry was appended as a consequence,
    /// in which case the caller should broadcast.
    fn advance_commit_index(&self, state: &mut NodeState, actions: &mut Vec<Action>) -> bool {
        let mut appended = false;
        loop {
            let Some(index) = committable_index(state) else {
                break;
            };
            self.commit_to(state, index, actions);
            if self.progress_configuration(state, actions) {
                appended = true;
            } else {
                break;
            }
        }
        appended
    }

    /// Move `commit_index` forward and hand the newly committed range to the
    /// state machine.
    fn commit_to(&self, state: &mut NodeState, index: u64, actions: &mut Vec<Action>) {
        if index <= state.commit_index {
            return;
        }
        state.commit_index = index;
        tracing::debug!(
            node_id = state.node_id,
            commit_index = index,
            "Updated commit index"
        );

        if state.last_applied < state.commit_index {
            let entries = state.get_entries_between(state.last_applied + 1, state.commit_index);
            state.last_applied = state.commit_index;
            if !entries.is_empty() {
                actions.push(Action::ApplyToStateMachine(entries));
            }
        }

        if state.configuration_phase == ConfigurationPhase::Finalizing
            && state
                .final_configuration_index
                .is_some_and(|final_index| final_index <= state.commit_index)
        {
            finalize_configuration(state);
        }
    }

    /// Leader-only: once the joint entry commits, append the final entry.
    fn progress_configuration(&self, state: &mut NodeState, actions: &mut Vec<Action>) -> bool {
        if !state.is_leader() || state.configuration_phase != ConfigurationPhase::Joint {
            return false;
        }
        let Some(joint_index) = state.joint_configuration_index else {
            return false;
        };
        if joint_index > state.commit_index {
            return false;
        }

        let members = state.new_configuration_members.clone();
        tracing::info!(
            node_id = state.node_id,
            joint_index,
            members = ?members,
            "Joint configuration committed, appending final configuration"
        );
        let entry = self.leader_append(state, Command::FinalConfiguration { members });
        actions.push(Action::PersistEntries(vec![entry]));
        true
    }

    // ---------------------------------------------------------------------
    // Replication (follower side)
    // ---------------------------------------------------------------------

    fn on_append_entries(
        &self,
        state: &mut NodeState,
        req: AppendEntriesRequest,
        actions: &mut Vec<Action>,
    ) {
        let leader_id = req.leader_id;
        let reject = |state: &NodeState, conflict_term: Option<u64>, conflict_index: Option<u64>| {
            Action::SendMessage {
                target: leader_id,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: state.current_term,
                    from: state.node_id,
                    success: false,
                    match_index: 0,
                    conflict_term,
                    conflict_index,
                }),
            }
        };

        if req.term < state.current_term {
            actions.push(reject(state, None, None));
            return;
        }

        if state.role != RaftRole::Follower {
            state.become_follower(req.term);
        }
        state.leader_id = Some(leader_id);
        state.pre_votes_granted.clear();
        actions.push(Action::ResetElectionTimer);

        // Below the snapshot boundary we cannot tell whether the logs match.
        if req.prev_log_index < state.snapshot_last_included_index {
            let conflict_index = state.snapshot_last_included_index + 1;
            actions.push(reject(state, None, Some(conflict_index)));
            return;
        }

        match state.term_at(req.prev_log_index) {
            None => {
                let conflict_index = state.last_log_index() + 1;
                actions.push(reject(state, None, Some(conflict_index)));
                return;
            }
            Some(term) if term != req.prev_log_term => {
                let first = state.first_index_of_term(term, req.prev_log_index);
                actions.push(reject(state, Some(term), Some(first)));
                return;
            }
            Some(_) => {}
        }

        let last_verified = req.prev_log_index + req.entries.len() as u64;
        let mut new_entries: Vec<LogEntry> = Vec::new();
        for entry in req.entries {
            if !new_entries.is_empty() {
                new_entries.push(entry);
                continue;
            }
            if entry.index <= state.snapshot_last_included_index {
                continue;
            }
            match state.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_suffix(state, entry.index, actions);
                    new_entries.push(entry);
                }
                None => new_entries.push(entry),
            }
        }

        if !new_entries.is_empty() {
            for entry in &new_entries {
                debug_assert_eq!(entry.index, state.last_log_index() + 1);
                state.log.push(entry.clone());
                state.track_configuration_entry(entry);
            }
            tracing::debug!(
                node_id = state.node_id,
                entries_appended = new_entries.len(),
                new_last_index = state.last_log_index(),
                "Appended entries"
            );
            actions.push(Action::PersistEntries(new_entries));
        }

        if req.leader_commit > state.commit_index {
            let new_commit = min(req.leader_commit, last_verified);
            self.commit_to(state, new_commit, actions);
        }

        actions.push(Action::SendMessage {
            target: leader_id,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: state.current_term,
                from: state.node_id,
                success: true,
                match_index: last_verified,
                conflict_term: None,
                conflict_index: None,
            }),
        });
    }

    /// Remove a conflicting suffix, unwinding any membership change it carried.
    fn truncate_suffix(&self, state: &mut NodeState, from_index: u64, actions: &mut Vec<Action>) {
        tracing::debug!(
            node_id = state.node_id,
            from_index,
            "Truncating conflicting log suffix"
        );
        state.truncate_from(from_index);
        actions.push(Action::TruncateLogSuffix { from_index });

        if state
            .final_configuration_index
            .is_some_and(|index| index >= from_index)
        {
            state.final_configuration_index = None;
            state.configuration_phase = ConfigurationPhase::Joint;
        }
        if state
            .joint_configuration_index
            .is_some_and(|index| index >= from_index)
        {
            state.clear_configuration_transition();
        }
    }

    fn on_install_snapshot(
        &self,
        state: &mut NodeState,
        req: InstallSnapshotRequest,
        actions: &mut Vec<Action>,
    ) {
        let respond = |state: &NodeState, success: bool| Action::SendMessage {
            target: req.leader_id,
            message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: state.current_term,
                from: state.node_id,
                last_included_index: req.last_included_index,
                success,
            }),
        };

        if req.term < state.current_term {
            actions.push(respond(state, false));
            return;
        }

        state.become_follower(req.term);
        state.leader_id = Some(req.leader_id);
        actions.push(Action::ResetElectionTimer);

        // Never roll back state the node has already committed.
        if req.last_included_index <= state.commit_index {
            actions.push(respond(state, true));
            return;
        }

        let keeps_suffix = state.term_at(req.last_included_index) == Some(req.last_included_term);
        if !keeps_suffix && state.last_log_index() > state.snapshot_last_included_index {
            let from_index = state.snapshot_last_included_index + 1;
            state.truncate_from(from_index);
            actions.push(Action::TruncateLogSuffix { from_index });
        }

        tracing::info!(
            node_id = state.node_id,
            last_included_index = req.last_included_index,
            last_included_term = req.last_included_term,
            "Installing snapshot from leader"
        );
        actions.push(Action::TakeSnapshot {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
            members: req.members.clone(),
            data: req.data.clone(),
        });

        state.compact_through(req.last_included_index, req.last_included_term);
        state.cluster_members = req.members.clone();
        state.reload_configuration_from_log();
        state.commit_index = max(state.commit_index, req.last_included_index);
        state.last_applied = max(state.last_applied, req.last_included_index);

        actions.push(respond(state, true));
    }

    // ---------------------------------------------------------------------
    // Client requests
    // ---------------------------------------------------------------------

    fn on_client_command(&self, state: &mut NodeState, data: Vec<u8>, actions: &mut Vec<Action>) {
        if !state.is_leader() {
            actions.push(Action::SendMessage {
                target: state.node_id,
                message: Message::ClientCommandResponse(ClientCommandResponse {
                    success: false,
                    index: None,
                    term: state.current_term,
                    leader_hint: state.leader_id,
                    reason: Some("not leader".into()),
                }),
            });
            return;
        }

        let entry = self.leader_append(state, Command::Data(data));
        let index = entry.index;
        tracing::debug!(index, term = entry.term, "Appended command to log");
        actions.push(Action::PersistEntries(vec![entry]));
        // Only a single-node cluster commits here; a broadcast follows either way.
        self.advance_commit_index(state, actions);
        self.broadcast_append_entries(state, actions);

        actions.push(Action::SendMessage {
            target: state.node_id,
            message: Message::ClientCommandResponse(ClientCommandResponse {
                success: true,
                index: Some(index),
                term: state.current_term,
                leader_hint: Some(state.node_id),
                reason: None,
            }),
        });
    }

    fn on_read_index(&self, state: &mut NodeState, actions: &mut Vec<Action>) {
        let rejection = |state: &NodeState, reason: &str| ReadIndexResponse {
            success: false,
            read_index: 0,
            term: state.current_term,
            leader_hint: state.leader_id,
            reason: Some(reason.to_string()),
        };

        let response = if !state.is_leader() {
            rejection(state, "not leader")
        } else if state.term_at(state.commit_index) != Some(state.current_term) {
            rejection(state, "leader has not committed an entry in its current term")
        } else {
            let read_index = state.commit_index;
            self.broadcast_append_entries(state, actions);
            ReadIndexResponse {
                success: true,
                read_index,
                term: state.current_term,
                leader_hint: Some(state.node_id),
                reason: None,
            }
        };

        actions.push(Action::SendMessage {
            target: state.node_id,
            message: Message::ReadIndexResponse(response),
        });
    }

    fn on_configuration_change(
        &self,
        state: &mut NodeState,
        req: ConfigurationChangeRequest,
        actions: &mut Vec<Action>,
    ) {
        let response = match validate_configuration_change(state, &req) {
            Err(reason) => {
                tracing::debug!(
                    node_id = state.node_id,
                    change = %req.change_type,
                    target = req.target_node_id,
                    reason,
                    "Configuration change rejected"
                );
                ConfigurationChangeResponse::rejected(reason, state.leader_id)
            }
            Ok(()) => self.begin_configuration_change(state, req, actions),
        };

        actions.push(Action::SendMessage {
            target: state.node_id,
            message: Message::ConfigurationChangeResponse(response),
        });
    }

    fn begin_configuration_change(
        &self,
        state: &mut NodeState,
        req: ConfigurationChangeRequest,
        actions: &mut Vec<Action>,
    ) -> ConfigurationChangeResponse {
        let old = state.cluster_members.clone();
        let mut new = old.clone();
        match req.change_type {
            ConfigurationChangeType::AddNode => {
                new.insert(req.target_node_id);
            }
            ConfigurationChangeType::RemoveNode => {
                new.remove(&req.target_node_id);
            }
        }

        tracing::info!(
            node_id = state.node_id,
            change = %req.change_type,
            target = req.target_node_id,
            old = ?old,
            new = ?new,
            "Starting configuration change"
        );

        let entry = self.leader_append(state, Command::JointConfiguration { old, new });
        let log_index = entry.index;
        state.pending_configuration_change = Some(PendingConfigurationChange {
            change_type: req.change_type,
            target_node_id: req.target_node_id,
            log_index,
        });
        if req.change_type == ConfigurationChangeType::AddNode {
            state.next_index.insert(req.target_node_id, 1);
            state.match_index.insert(req.target_node_id, 0);
        }

        actions.push(Action::PersistEntries(vec![entry]));
        self.advance_commit_index(state, actions);
        self.broadcast_append_entries(state, actions);

        ConfigurationChangeResponse {
            success: true,
            committed: state.configuration_phase == ConfigurationPhase::None,
            log_index: Some(log_index),
            leader_hint: Some(state.node_id),
            reason: None,
        }
    }
}

/// Reasons are checked in a fixed order so callers see the most basic
/// problem first.
fn validate_configuration_change(
    state: &NodeState,
    req: &ConfigurationChangeRequest,
) -> Result<(), &'static str> {
    if !state.is_leader() {
        return Err("not leader");
    }
    if req.target_node_id == 0 {
        return Err("malformed target node id");
    }
    if state.configuration_phase != ConfigurationPhase::None
        || state.pending_configuration_change.is_some()
    {
        return Err("configuration change already in progress");
    }
    match req.change_type {
        ConfigurationChangeType::AddNode => {
            if state.cluster_members.contains(&req.target_node_id) {
                return Err("node is already a member");
            }
        }
        ConfigurationChangeType::RemoveNode => {
            if !state.cluster_members.contains(&req.target_node_id) {
                return Err("node is not a member");
            }
            if state.cluster_members.len() - 1 < MIN_CLUSTER_SIZE_AFTER_REMOVAL {
                return Err("removal would shrink the cluster below 3 members");
            }
            if req.target_node_id == state.node_id {
                return Err("leader cannot remove itself");
            }
        }
    }
    Ok(())
}

/// Highest index above `commit_index` that a quorum holds and that belongs to
/// the current term. Earlier-term entries commit only transitively.
fn committable_index(state: &NodeState) -> Option<u64> {
    if !state.is_leader() {
        return None;
    }
    let mut index = state.last_log_index();
    while index > state.commit_index {
        match state.term_at(index) {
            Some(term) if term == state.current_term => {
                if membership::is_replicated_by_quorum(state, index) {
                    return Some(index);
                }
            }
            _ => return None,
        }
        index -= 1;
    }
    None
}

fn finalize_configuration(state: &mut NodeState) {
    let members = std::mem::take(&mut state.new_configuration_members);
    tracing::info!(
        node_id = state.node_id,
        members = ?members,
        "Configuration change committed"
    );
    state.cluster_members = members;
    state.clear_configuration_transition();

    if state.is_leader() {
        let members = state.cluster_members.clone();
        let node_id = state.node_id;
        state
            .next_index
            .retain(|id, _| members.contains(id) && *id != node_id);
        state
            .match_index
            .retain(|id, _| members.contains(id) || *id == node_id);
    }
}
