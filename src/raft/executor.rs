//! Runs the engine against real collaborators.
//!
//! One `tokio::sync::Mutex` guards the node state. Every engine invocation
//! and the actions it produces run while that gate is held, except for the
//! middle phase of a ReadIndex where heartbeats are sent without it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::action::Action;
use crate::raft::engine::{Engine, EngineConfig};
use crate::raft::membership;
use crate::raft::message::{
    AppendEntriesRequest, ClientCommandResponse, ConfigurationChangeRequest,
    ConfigurationChangeResponse, InstallSnapshotRequest, Message, ReadIndexResponse,
};
use crate::raft::state::{ConfigurationPhase, LogEntry, NodeState, RaftRole};
use crate::raft::storage::{LogStore, Snapshot, SnapshotStore, StateMachine, StateStore};
use crate::raft::transport::{TimerControl, Transport};

/// External collaborators an executor drives.
#[derive(Clone)]
pub struct Collaborators {
    pub state_store: Arc<dyn StateStore>,
    pub log_store: Arc<dyn LogStore>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub state_machine: Arc<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
    pub timers: Arc<dyn TimerControl>,
}

/// Point-in-time summary of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_last_included_index: u64,
    pub cluster_members: BTreeSet<u64>,
    pub configuration_phase: ConfigurationPhase,
}

/// Everything behind the gate.
struct Inner {
    state: NodeState,
    initialized: bool,
    /// Keyed by the joint-configuration entry index.
    config_waiters: HashMap<u64, oneshot::Sender<ConfigurationChangeResponse>>,
}

pub struct Executor {
    config: RaftConfig,
    engine: Engine,
    inner: Mutex<Inner>,
    collaborators: Collaborators,
    applied_tx: watch::Sender<u64>,
}

impl Executor {
    pub fn new(config: RaftConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let state = NodeState::new(config.node_id, config.members.iter().copied());
        let (applied_tx, _) = watch::channel(0);

        Ok(Self {
            engine: Engine::new(EngineConfig::from(&config)),
            config,
            inner: Mutex::new(Inner {
                state,
                initialized: false,
                config_waiters: HashMap::new(),
            }),
            collaborators,
            applied_tx,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    /// Restore persisted term, vote, snapshot and log.
    ///
    /// Persisted entries are not assumed committed: `commit_index` and
    /// `last_applied` restart at the snapshot boundary and only the snapshot
    /// is loaded into the state machine. Calling this twice is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.initialized {
            return Ok(());
        }

        let (term, voted_for) = self.collaborators.state_store.load().await?;
        let snapshot = self.collaborators.snapshot_store.load().await?;
        let entries = self.collaborators.log_store.get_all().await?;

        let state = &mut inner.state;
        state.current_term = term;
        state.voted_for = voted_for;

        if let Some(snapshot) = snapshot {
            self.collaborators
                .state_machine
                .restore_snapshot(&snapshot.data)
                .await?;
            state.snapshot_last_included_index = snapshot.last_included_index;
            state.snapshot_last_included_term = snapshot.last_included_term;
            state.cluster_members = snapshot.members;
        }

        let boundary = state.snapshot_last_included_index;
        state.log = entries.into_iter().filter(|e| e.index > boundary).collect();
        check_contiguous(&state.log, boundary)?;
        state.reload_configuration_from_log();

        state.commit_index = boundary;
        state.last_applied = boundary;
        state.role = RaftRole::Follower;
        state.leader_id = None;

        tracing::info!(
            node_id = state.node_id,
            term = state.current_term,
            voted_for = ?state.voted_for,
            snapshot_index = boundary,
            last_log_index = state.last_log_index(),
            members = ?state.cluster_members,
            "Node initialized"
        );

        self.applied_tx.send_replace(boundary);
        inner.initialized = true;
        self.collaborators.timers.reset_election_timer();
        Ok(())
    }

    /// Feed one message through the engine and perform its actions.
    pub async fn handle(&self, message: Message) -> Result<()> {
        self.handle_rpc(message).await.map(|_| ())
    }

    /// Like [`Executor::handle`], but returns the reply addressed to whoever
    /// sent `message` instead of putting it on the network.
    pub async fn handle_rpc(&self, message: Message) -> Result<Option<Message>> {
        let reply_to = self.reply_target(&message);
        let mut inner = self.inner.lock().await;
        let reply = self.process(&mut inner, message, reply_to, 0).await;
        self.settle_configuration_waiters(&mut inner);
        reply
    }

    /// Append a client command on the leader.
    ///
    /// Returns once the entry is persisted locally and replication has been
    /// attempted; use [`Executor::wait_applied`] to wait for application.
    pub async fn propose(&self, data: Vec<u8>) -> Result<ClientCommandResponse> {
        match self.handle_rpc(Message::ClientCommandRequest(data)).await? {
            Some(Message::ClientCommandResponse(resp)) => Ok(resp),
            other => Err(unexpected_reply("ClientCommandRequest", other)),
        }
    }

    /// Confirm leadership with a heartbeat round and return a read index.
    ///
    /// The gate is released while heartbeats are in flight.
    pub async fn read_index(&self) -> Result<ReadIndexResponse> {
        // Phase 1: capture the read index and the heartbeats to send.
        let (response, heartbeats, term) = {
            let mut inner = self.inner.lock().await;
            let actions = self
                .engine
                .handle(&mut inner.state, Message::ReadIndexRequest);

            let node_id = inner.state.node_id;
            let mut response = None;
            let mut heartbeats = Vec::new();
            let mut local = Vec::new();
            for action in actions {
                match action {
                    Action::SendMessage {
                        message: Message::ReadIndexResponse(resp),
                        target,
                    } if target == node_id => response = Some(resp),
                    Action::SendMessage { target, message } if target != node_id => {
                        heartbeats.push((target, message))
                    }
                    other => local.push(other),
                }
            }
            self.execute(&mut inner, local, None, 0).await?;

            let Some(response) = response else {
                return Err(RaftError::Internal(
                    "engine produced no ReadIndex response".into(),
                ));
            };
            (response, heartbeats, inner.state.current_term)
        };

        if !response.success {
            return Ok(response);
        }

        // Phase 2: heartbeats without the gate.
        let rpc_timeout = self.rpc_timeout();
        let transport = &self.collaborators.transport;
        let sends = heartbeats.into_iter().map(|(target, message)| async move {
            match timeout(rpc_timeout, transport.send(target, message)).await {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(e)) => {
                    tracing::trace!(peer_id = target, error = %e, "ReadIndex heartbeat failed");
                    None
                }
                Err(_) => {
                    tracing::trace!(peer_id = target, "ReadIndex heartbeat timed out");
                    None
                }
            }
        });
        let replies: Vec<Message> = join_all(sends).await.into_iter().flatten().collect();

        let mut acked = BTreeSet::from([self.config.node_id]);
        for reply in &replies {
            if let Message::AppendEntriesResponse(resp) = reply {
                if resp.term == term {
                    acked.insert(resp.from);
                }
            }
        }

        // Phase 3: bookkeeping under the gate.
        let mut inner = self.inner.lock().await;
        for reply in replies {
            self.process(&mut inner, reply, None, 1).await?;
        }
        self.settle_configuration_waiters(&mut inner);

        let state = &inner.state;
        let confirmed = state.is_leader()
            && state.current_term == term
            && membership::has_quorum(state, &acked);
        tracing::debug!(
            node_id = state.node_id,
            read_index = response.read_index,
            acks = acked.len(),
            confirmed,
            "ReadIndex heartbeat round finished"
        );

        if confirmed {
            Ok(response)
        } else {
            Ok(ReadIndexResponse {
                success: false,
                read_index: 0,
                term: state.current_term,
                leader_hint: state.leader_id,
                reason: Some("leadership not confirmed by a quorum".into()),
            })
        }
    }

    /// Start a membership change and wait until it fully commits, fails
    /// because leadership was lost, or `cancel` fires.
    pub async fn change_configuration(
        &self,
        request: ConfigurationChangeRequest,
        cancel: &CancellationToken,
    ) -> Result<ConfigurationChangeResponse> {
        let (index, rx) = {
            let mut inner = self.inner.lock().await;
            let node_id = inner.state.node_id;
            let reply = self
                .process(
                    &mut inner,
                    Message::ConfigurationChangeRequest(request),
                    Some(node_id),
                    0,
                )
                .await;
            let resp = match reply {
                Ok(Some(Message::ConfigurationChangeResponse(resp))) => resp,
                Ok(other) => {
                    self.settle_configuration_waiters(&mut inner);
                    return Err(unexpected_reply("ConfigurationChangeRequest", other));
                }
                Err(e) => {
                    self.settle_configuration_waiters(&mut inner);
                    return Err(e);
                }
            };

            let index = match resp.log_index {
                Some(index) if resp.success && !resp.committed => index,
                _ => {
                    self.settle_configuration_waiters(&mut inner);
                    return Ok(resp);
                }
            };

            let (tx, rx) = oneshot::channel();
            inner.config_waiters.insert(index, tx);
            self.settle_configuration_waiters(&mut inner);
            (index, rx)
        };

        tokio::select! {
            result = rx => result.map_err(|_| {
                RaftError::Internal("configuration waiter dropped".into())
            }),
            _ = cancel.cancelled() => {
                self.inner.lock().await.config_waiters.remove(&index);
                tracing::debug!(
                    node_id = self.config.node_id,
                    index,
                    "Configuration change wait cancelled"
                );
                Err(RaftError::Cancelled)
            }
        }
    }

    /// Wait until `last_applied` reaches `index`.
    pub async fn wait_applied(&self, index: u64, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        tokio::select! {
            result = rx.wait_for(|&applied| applied >= index) => result
                .map(|_| ())
                .map_err(|_| RaftError::Internal("applied index channel closed".into())),
            _ = cancel.cancelled() => Err(RaftError::Cancelled),
        }
    }

    pub async fn status(&self) -> RaftStatus {
        let inner = self.inner.lock().await;
        let state = &inner.state;
        RaftStatus {
            node_id: state.node_id,
            role: state.role,
            current_term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            snapshot_last_included_index: state.snapshot_last_included_index,
            cluster_members: state.cluster_members.clone(),
            configuration_phase: state.configuration_phase,
        }
    }

    /// A copy of the full node state.
    pub async fn node_state(&self) -> NodeState {
        self.inner.lock().await.state.clone()
    }

    /// Client requests are answered locally; peer requests go back to their
    /// sender; responses and timer ticks have no one to answer.
    fn reply_target(&self, message: &Message) -> Option<u64> {
        if message.is_client_request() {
            Some(self.config.node_id)
        } else if message.is_response() {
            None
        } else {
            message.sender()
        }
    }

    fn process<'a>(
        &'a self,
        inner: &'a mut Inner,
        message: Message,
        reply_to: Option<u64>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<Message>>> {
        async move {
            tracing::trace!(
                node_id = inner.state.node_id,
                message = message.name(),
                depth,
                "Handling message"
            );
            let actions = self.engine.handle(&mut inner.state, message);
            self.execute(inner, actions, reply_to, depth).await
        }
        .boxed()
    }

    /// Persistence first, then apply/send/timer actions in engine order.
    async fn execute(
        &self,
        inner: &mut Inner,
        actions: Vec<Action>,
        reply_to: Option<u64>,
        depth: usize,
    ) -> Result<Option<Message>> {
        let (persistence, effects): (Vec<Action>, Vec<Action>) =
            actions.into_iter().partition(Action::is_persistence);

        for action in persistence {
            self.persist(inner, action).await?;
        }

        let mut reply = None;
        for action in effects {
            match action {
                Action::ApplyToStateMachine(entries) => self.apply(inner, &entries).await?,
                Action::SendMessage { target, message } => {
                    if reply.is_none() && reply_to == Some(target) {
                        reply = Some(message);
                    } else if target == inner.state.node_id {
                        tracing::trace!(
                            node_id = target,
                            message = message.name(),
                            "No local caller for response, dropping"
                        );
                    } else {
                        self.send(inner, target, message, depth).await?;
                    }
                }
                Action::SendSnapshotToPeer { target } => {
                    self.send_snapshot(inner, target, depth).await?
                }
                Action::ResetElectionTimer => self.collaborators.timers.reset_election_timer(),
                Action::ResetHeartbeatTimer => self.collaborators.timers.reset_heartbeat_timer(),
                other => self.persist(inner, other).await?,
            }
        }
        Ok(reply)
    }

    async fn persist(&self, inner: &mut Inner, action: Action) -> Result<()> {
        match action {
            Action::PersistState { term, voted_for } => {
                self.collaborators.state_store.save(term, voted_for).await
            }
            Action::PersistEntries(entries) => self.collaborators.log_store.append(&entries).await,
            Action::TruncateLogSuffix { from_index } => {
                self.collaborators
                    .log_store
                    .truncate_suffix(from_index)
                    .await
            }
            Action::TakeSnapshot {
                last_included_index,
                last_included_term,
                members,
                data,
            } => {
                let snapshot = Snapshot {
                    last_included_index,
                    last_included_term,
                    members,
                    data,
                };
                self.collaborators.snapshot_store.save(&snapshot).await?;
                self.collaborators
                    .state_machine
                    .restore_snapshot(&snapshot.data)
                    .await?;
                self.collaborators
                    .log_store
                    .compact_prefix(last_included_index)
                    .await?;
                tracing::info!(
                    node_id = inner.state.node_id,
                    last_included_index,
                    last_included_term,
                    "Snapshot installed"
                );
                self.applied_tx.send_replace(inner.state.last_applied);
                Ok(())
            }
            other => Err(RaftError::Internal(format!(
                "{:?} is not a persistence action",
                other
            ))),
        }
    }

    async fn apply(&self, inner: &mut Inner, entries: &[LogEntry]) -> Result<()> {
        self.collaborators.state_machine.apply(entries).await?;
        self.applied_tx.send_replace(inner.state.last_applied);

        if inner.state.log.len() > self.config.snapshot_threshold {
            self.take_snapshot(inner).await?;
        }
        Ok(())
    }

    /// Snapshot the state machine at `last_applied` and compact the log.
    ///
    /// Skipped while a membership change is in flight so the snapshot's
    /// member set is never a transitional one.
    async fn take_snapshot(&self, inner: &mut Inner) -> Result<Option<Snapshot>> {
        let state = &inner.state;
        if state.configuration_phase != ConfigurationPhase::None {
            tracing::debug!(
                node_id = state.node_id,
                phase = %state.configuration_phase,
                "Deferring snapshot during membership change"
            );
            return Ok(None);
        }
        let index = state.last_applied;
        if index <= state.snapshot_last_included_index {
            return Ok(None);
        }
        let term = state.term_at(index).ok_or_else(|| {
            RaftError::Internal(format!("no term for applied index {}", index))
        })?;

        let data = self.collaborators.state_machine.create_snapshot().await?;
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            members: state.cluster_members.clone(),
            data,
        };
        self.collaborators.snapshot_store.save(&snapshot).await?;
        self.collaborators.log_store.compact_prefix(index).await?;
        inner.state.compact_through(index, term);

        tracing::info!(
            node_id = inner.state.node_id,
            last_included_index = index,
            last_included_term = term,
            remaining_entries = inner.state.log.len(),
            "Snapshot taken"
        );
        Ok(Some(snapshot))
    }

    /// A follower trailing the commit index by more than the lag threshold
    /// gets a fresh snapshot instead of the backlog.
    fn lags_behind(&self, state: &NodeState, req: &AppendEntriesRequest) -> bool {
        self.config.snapshot_lag_threshold > 0
            && state.is_leader()
            && state.configuration_phase == ConfigurationPhase::None
            && state.commit_index
                > req
                    .prev_log_index
                    .saturating_add(self.config.snapshot_lag_threshold)
    }

    async fn send(
        &self,
        inner: &mut Inner,
        target: u64,
        message: Message,
        depth: usize,
    ) -> Result<()> {
        if let Message::AppendEntriesRequest(req) = &message {
            if self.lags_behind(&inner.state, req) {
                tracing::debug!(
                    node_id = inner.state.node_id,
                    peer_id = target,
                    prev_log_index = req.prev_log_index,
                    commit_index = inner.state.commit_index,
                    "Peer is far behind, sending a fresh snapshot"
                );
                self.take_snapshot(inner).await?;
                return self.send_snapshot(inner, target, depth).await;
            }
        }
        self.send_and_process_reply(inner, target, message, depth)
            .await
    }

    async fn send_snapshot(&self, inner: &mut Inner, target: u64, depth: usize) -> Result<()> {
        if !inner.state.is_leader() {
            return Ok(());
        }
        let Some(snapshot) = self.collaborators.snapshot_store.load().await? else {
            tracing::warn!(
                node_id = inner.state.node_id,
                peer_id = target,
                "Snapshot requested for peer but none is stored"
            );
            return Ok(());
        };

        tracing::debug!(
            node_id = inner.state.node_id,
            peer_id = target,
            last_included_index = snapshot.last_included_index,
            "Sending InstallSnapshot"
        );
        let request = InstallSnapshotRequest {
            term: inner.state.current_term,
            leader_id: inner.state.node_id,
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            members: snapshot.members,
            data: snapshot.data,
        };
        self.send_and_process_reply(inner, target, Message::InstallSnapshotRequest(request), depth)
            .await
    }

    /// Transport failures and timeouts are dropped messages, never errors.
    async fn send_and_process_reply(
        &self,
        inner: &mut Inner,
        target: u64,
        message: Message,
        depth: usize,
    ) -> Result<()> {
        let name = message.name();
        let reply = match timeout(
            self.rpc_timeout(),
            self.collaborators.transport.send(target, message),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::trace!(peer_id = target, message = name, error = %e, "RPC failed");
                return Ok(());
            }
            Err(_) => {
                tracing::trace!(peer_id = target, message = name, "RPC timed out");
                return Ok(());
            }
        };

        if depth + 1 > self.config.max_reply_depth {
            tracing::debug!(
                node_id = inner.state.node_id,
                peer_id = target,
                depth,
                "Reply nesting limit reached, dropping reply"
            );
            return Ok(());
        }
        self.process(inner, reply, None, depth + 1).await?;
        Ok(())
    }

    /// Complete configuration waiters whose outcome is now known.
    fn settle_configuration_waiters(&self, inner: &mut Inner) {
        if inner.config_waiters.is_empty() {
            return;
        }
        let state = &inner.state;

        if !state.is_leader() {
            let leader_hint = state.leader_id;
            for (index, tx) in inner.config_waiters.drain() {
                tracing::info!(
                    node_id = state.node_id,
                    index,
                    "Leadership lost before configuration change committed"
                );
                let _ = tx.send(ConfigurationChangeResponse {
                    success: false,
                    committed: false,
                    log_index: Some(index),
                    leader_hint,
                    reason: Some("leadership lost".into()),
                });
            }
            return;
        }

        if state.configuration_phase == ConfigurationPhase::None {
            let leader_hint = Some(state.node_id);
            for (index, tx) in inner.config_waiters.drain() {
                let _ = tx.send(ConfigurationChangeResponse {
                    success: true,
                    committed: true,
                    log_index: Some(index),
                    leader_hint,
                    reason: None,
                });
            }
        }
    }
}

fn check_contiguous(log: &[LogEntry], boundary: u64) -> Result<()> {
    for (offset, entry) in log.iter().enumerate() {
        let expected = boundary + 1 + offset as u64;
        if entry.index != expected {
            return Err(RaftError::Storage(format!(
                "log is not contiguous: expected index {}, found {}",
                expected, entry.index
            )));
        }
    }
    Ok(())
}

fn unexpected_reply(request: &str, reply: Option<Message>) -> RaftError {
    RaftError::Internal(format!(
        "unexpected reply to {}: {}",
        request,
        reply.as_ref().map(Message::name).unwrap_or("none")
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::raft::memory::{
        MemLogStore, MemSnapshotStore, MemStateMachine, MemStateStore, NoopTimers,
    };
    use crate::raft::message::{
        AppendEntriesResponse, ConfigurationChangeType, RequestVoteRequest, RequestVoteResponse,
    };
    use crate::raft::state::Command;

    /// Answers every request with a canned reply and records the order of
    /// outbound sends.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: StdMutex<Vec<(u64, &'static str)>>,
        reply: StdMutex<Option<Message>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, target: u64, message: Message) -> Result<Message> {
            self.sent.lock().unwrap().push((target, message.name()));
            self.reply
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| RaftError::Transport("unreachable".into()))
        }
    }

    struct Fixture {
        executor: Executor,
        state_store: Arc<MemStateStore>,
        log_store: Arc<MemLogStore>,
        state_machine: Arc<MemStateMachine>,
        transport: Arc<ScriptedTransport>,
    }

    fn fixture(config: RaftConfig) -> Fixture {
        let state_store = Arc::new(MemStateStore::default());
        let log_store = Arc::new(MemLogStore::default());
        let state_machine = Arc::new(MemStateMachine::default());
        let transport = Arc::new(ScriptedTransport::default());
        let executor = Executor::new(
            config,
            Collaborators {
                state_store: state_store.clone(),
                log_store: log_store.clone(),
                snapshot_store: Arc::new(MemSnapshotStore::default()),
                state_machine: state_machine.clone(),
                transport: transport.clone(),
                timers: Arc::new(NoopTimers),
            },
        )
        .unwrap();
        Fixture {
            executor,
            state_store,
            log_store,
            state_machine,
            transport,
        }
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let result = Executor::new(
            RaftConfig::new(4, [1, 2, 3]),
            Collaborators {
                state_store: Arc::new(MemStateStore::default()),
                log_store: Arc::new(MemLogStore::default()),
                snapshot_store: Arc::new(MemSnapshotStore::default()),
                state_machine: Arc::new(MemStateMachine::default()),
                transport: Arc::new(ScriptedTransport::default()),
                timers: Arc::new(NoopTimers),
            },
        );
        assert!(matches!(result, Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn test_lag_check_saturates_on_huge_threshold() {
        let f = fixture(RaftConfig::new(1, [1, 2, 3]).with_snapshot_lag_threshold(u64::MAX));
        let mut state = NodeState::new(1, [1, 2, 3]);
        state.current_term = 1;
        state.become_leader(&[2, 3]);
        state.commit_index = 10;
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: 1,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 10,
        };
        assert!(!f.executor.lags_behind(&state, &req));

        let f = fixture(RaftConfig::new(1, [1, 2, 3]).with_snapshot_lag_threshold(2));
        assert!(f.executor.lags_behind(&state, &req));
    }

    #[tokio::test]
    async fn test_rpc_reply_is_captured_not_sent() {
        let f = fixture(RaftConfig::new(2, [1, 2, 3]));
        f.executor.initialize().await.unwrap();

        let reply = f
            .executor
            .handle_rpc(Message::RequestVoteRequest(RequestVoteRequest {
                term: 1,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
                is_pre_vote: false,
            }))
            .await
            .unwrap();

        match reply {
            Some(Message::RequestVoteResponse(resp)) => assert!(resp.vote_granted),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(f.transport.sent.lock().unwrap().is_empty());
        // The vote reached the state store before the reply was returned
        assert_eq!(f.state_store.load().await.unwrap(), (1, Some(1)));
    }

    #[tokio::test]
    async fn test_single_node_propose_applies() {
        let f = fixture(RaftConfig::new(1, [1]));
        f.executor.initialize().await.unwrap();
        f.executor.handle(Message::ElectionTimeoutElapsed).await.unwrap();

        let resp = f.executor.propose(b"hello".to_vec()).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.index, Some(2));

        let cancel = CancellationToken::new();
        f.executor.wait_applied(2, &cancel).await.unwrap();
        assert_eq!(f.state_machine.applied_data(), vec![b"hello".to_vec()]);
        assert_eq!(f.log_store.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_follower_propose_returns_leader_hint() {
        let f = fixture(RaftConfig::new(2, [1, 2, 3]));
        f.executor
            .handle(Message::AppendEntriesRequest(AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            }))
            .await
            .unwrap();

        let resp = f.executor.propose(b"x".to_vec()).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.leader_hint, Some(1));
    }

    #[tokio::test]
    async fn test_leader_retry_chain_stops_at_depth_limit() {
        let config = RaftConfig::new(1, [1, 2]).with_pre_vote(false);
        let f = fixture(config);
        *f.transport.reply.lock().unwrap() = Some(Message::AppendEntriesResponse(
            AppendEntriesResponse {
                term: 1,
                from: 2,
                success: false,
                match_index: 0,
                conflict_term: None,
                conflict_index: Some(1),
            },
        ));

        // Peer 2 answers every request with a rejection, forever
        f.executor.handle(Message::ElectionTimeoutElapsed).await.unwrap();
        assert_eq!(f.executor.status().await.role, RaftRole::Candidate);
        // Hand the node the missing vote directly
        f.executor
            .handle(Message::RequestVoteResponse(RequestVoteResponse {
                term: 1,
                from: 2,
                vote_granted: true,
                is_pre_vote: false,
            }))
            .await
            .unwrap();

        let appends = f
            .transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name)| *name == "AppendEntriesRequest")
            .count();
        // One initial broadcast plus one retry per nesting level
        assert_eq!(appends, f.executor.config().max_reply_depth + 1);
        assert_eq!(f.executor.status().await.role, RaftRole::Leader);
    }

    #[tokio::test]
    async fn test_initialize_resets_commit_to_snapshot_boundary() {
        let f = fixture(RaftConfig::new(1, [1, 2, 3]));
        f.state_store.save(3, Some(2)).await.unwrap();
        f.log_store
            .append(&[
                LogEntry {
                    term: 3,
                    index: 1,
                    command: Command::Data(b"a".to_vec()),
                },
                LogEntry {
                    term: 3,
                    index: 2,
                    command: Command::Data(b"b".to_vec()),
                },
            ])
            .await
            .unwrap();

        f.executor.initialize().await.unwrap();
        // Idempotent
        f.executor.initialize().await.unwrap();

        let state = f.executor.node_state().await;
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, Some(2));
        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
        assert!(f.state_machine.applied_data().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_rejects_gapped_log() {
        let f = fixture(RaftConfig::new(1, [1]));
        f.log_store
            .append(&[LogEntry {
                term: 1,
                index: 3,
                command: Command::Noop,
            }])
            .await
            .unwrap();
        assert!(matches!(
            f.executor.initialize().await,
            Err(RaftError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_taken_past_threshold() {
        let config = RaftConfig::new(1, [1]).with_snapshot_threshold(3);
        let f = fixture(config);
        f.executor.initialize().await.unwrap();
        f.executor.handle(Message::ElectionTimeoutElapsed).await.unwrap();

        for i in 0..4u8 {
            let resp = f.executor.propose(vec![i]).await.unwrap();
            assert!(resp.success);
        }

        let state = f.executor.node_state().await;
        assert!(state.snapshot_last_included_index >= 4);
        assert!(state.log.len() <= 3);
        assert_eq!(
            f.log_store.get_all().await.unwrap().len(),
            state.log.len()
        );
        assert_eq!(f.state_machine.applied_data().len(), 4);
    }

    #[tokio::test]
    async fn test_wait_applied_cancelled() {
        let f = fixture(RaftConfig::new(1, [1, 2, 3]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            f.executor.wait_applied(10, &cancel).await,
            Err(RaftError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_configuration_change_rejection_returns_immediately() {
        let f = fixture(RaftConfig::new(2, [1, 2, 3]));
        let cancel = CancellationToken::new();
        let resp = f
            .executor
            .change_configuration(
                ConfigurationChangeRequest {
                    change_type: ConfigurationChangeType::AddNode,
                    target_node_id: 4,
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(!resp.success);
        assert_eq!(resp.reason.as_deref(), Some("not leader"));
    }
}
