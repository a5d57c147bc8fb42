//! In-memory collaborators.
//!
//! Everything here lives for the lifetime of the value, so "crashing" a node
//! means dropping its executor and building a new one over the same stores.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::executor::Executor;
use crate::raft::message::Message;
use crate::raft::state::{Command, LogEntry};
use crate::raft::storage::{LogStore, Snapshot, SnapshotStore, StateMachine, StateStore};
use crate::raft::transport::{TimerControl, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemStateStore {
    hard_state: Mutex<(u64, Option<u64>)>,
}

#[async_trait]
impl StateStore for MemStateStore {
    async fn save(&self, term: u64, voted_for: Option<u64>) -> Result<()> {
        *lock(&self.hard_state) = (term, voted_for);
        Ok(())
    }

    async fn load(&self) -> Result<(u64, Option<u64>)> {
        Ok(*lock(&self.hard_state))
    }
}

#[derive(Debug, Default)]
pub struct MemLogStore {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut stored = lock(&self.entries);
        if let (Some(last), Some(first)) = (stored.last(), entries.first()) {
            if first.index != last.index + 1 {
                return Err(RaftError::Storage(format!(
                    "append at index {} does not follow last index {}",
                    first.index, last.index
                )));
            }
        }
        stored.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_suffix(&self, from_index: u64) -> Result<()> {
        lock(&self.entries).retain(|e| e.index < from_index);
        Ok(())
    }

    async fn compact_prefix(&self, up_to_index: u64) -> Result<()> {
        lock(&self.entries).retain(|e| e.index > up_to_index);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<LogEntry>> {
        Ok(lock(&self.entries).clone())
    }
}

#[derive(Debug, Default)]
pub struct MemSnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *lock(&self.snapshot) = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(lock(&self.snapshot).clone())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct MachineState {
    last_applied: u64,
    commands: Vec<Vec<u8>>,
}

/// Records every applied `Data` command in order.
///
/// Entries at or below the last applied index are skipped, so re-delivery
/// after a restart is harmless.
#[derive(Debug, Default)]
pub struct MemStateMachine {
    state: Mutex<MachineState>,
}

impl MemStateMachine {
    pub fn applied_data(&self) -> Vec<Vec<u8>> {
        lock(&self.state).commands.clone()
    }

    pub fn last_applied_index(&self) -> u64 {
        lock(&self.state).last_applied
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    async fn apply(&self, entries: &[LogEntry]) -> Result<()> {
        let mut state = lock(&self.state);
        for entry in entries {
            if entry.index <= state.last_applied {
                continue;
            }
            if let Command::Data(data) = &entry.command {
                state.commands.push(data.clone());
            }
            state.last_applied = entry.index;
        }
        Ok(())
    }

    async fn create_snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&*lock(&self.state)).map_err(|e| RaftError::StateMachine(e.to_string()))
    }

    async fn restore_snapshot(&self, data: &[u8]) -> Result<()> {
        let restored: MachineState =
            serde_json::from_slice(data).map_err(|e| RaftError::StateMachine(e.to_string()))?;
        *lock(&self.state) = restored;
        Ok(())
    }
}

/// Timer control that ignores every reset. For executors driven by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimers;

impl TimerControl for NoopTimers {
    fn reset_election_timer(&self) {}

    fn reset_heartbeat_timer(&self) {}
}

/// In-process network connecting executors, with fault injection.
///
/// Links are directional: a blocked `a -> b` loses requests from `a` to `b`,
/// a blocked `b -> a` loses the replies.
#[derive(Default)]
pub struct MemNetwork {
    nodes: RwLock<HashMap<u64, Weak<Executor>>>,
    /// Partition group per node; nodes in different groups cannot talk.
    groups: RwLock<HashMap<u64, u64>>,
    dropped_links: RwLock<HashSet<(u64, u64)>>,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The transport `node_id` should be built with.
    pub fn transport(self: &Arc<Self>, node_id: u64) -> Arc<MemTransport> {
        Arc::new(MemTransport {
            network: Arc::clone(self),
            from: node_id,
        })
    }

    pub fn register(&self, executor: &Arc<Executor>) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(executor.node_id(), Arc::downgrade(executor));
    }

    /// Stop delivering to `node_id`, as if it crashed.
    pub fn unregister(&self, node_id: u64) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node_id);
    }

    /// Split the nodes into groups that can only reach their own members.
    /// Nodes not listed form one further group.
    pub fn partition(&self, groups: &[&[u64]]) {
        let mut assigned = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        assigned.clear();
        for (group_id, members) in groups.iter().enumerate() {
            for &node_id in members.iter() {
                assigned.insert(node_id, group_id as u64 + 1);
            }
        }
        tracing::debug!(groups = ?groups, "Network partitioned");
    }

    pub fn isolate(&self, node_id: u64) {
        self.partition(&[&[node_id]]);
    }

    /// Remove every partition and dropped link.
    pub fn heal(&self) {
        self.groups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dropped_links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Network healed");
    }

    pub fn drop_link(&self, from: u64, to: u64) {
        self.dropped_links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((from, to));
    }

    pub fn restore_link(&self, from: u64, to: u64) {
        self.dropped_links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(from, to));
    }

    fn can_reach(&self, from: u64, to: u64) -> bool {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let same_group = groups.get(&from).copied().unwrap_or(0)
            == groups.get(&to).copied().unwrap_or(0);
        let link_up = !self
            .dropped_links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(from, to));
        same_group && link_up
    }

    fn node(&self, node_id: u64) -> Option<Arc<Executor>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node_id)
            .and_then(Weak::upgrade)
    }
}

pub struct MemTransport {
    network: Arc<MemNetwork>,
    from: u64,
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, target: u64, message: Message) -> Result<Message> {
        if !self.network.can_reach(self.from, target) {
            return Err(RaftError::Transport(format!(
                "link {} -> {} is down",
                self.from, target
            )));
        }
        let executor = self.network.node(target).ok_or_else(|| {
            RaftError::Transport(format!("node {} is not reachable", target))
        })?;

        // A spawned task keeps running if the caller gives up on the reply,
        // so the receiver never stops halfway through its actions.
        let reply = tokio::spawn(async move { executor.handle_rpc(message).await })
            .await
            .map_err(|e| RaftError::Transport(e.to_string()))??;
        let reply = reply.ok_or_else(|| {
            RaftError::Transport(format!("node {} produced no reply", target))
        })?;

        if !self.network.can_reach(target, self.from) {
            return Err(RaftError::Transport(format!(
                "reply {} -> {} lost",
                target, self.from
            )));
        }
        Ok(reply)
    }
}
