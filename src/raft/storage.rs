//! Durable storage and state machine seams.
//!
//! The executor is the only caller. Every method is awaited with the gate
//! held, so implementations never see two calls from one node at once.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::state::LogEntry;

/// A point-in-time image of the state machine plus the log position and
/// membership it reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub members: BTreeSet<u64>,
    pub data: Vec<u8>,
}

/// Persists `current_term` and `voted_for`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, term: u64, voted_for: Option<u64>) -> Result<()>;

    /// Returns `(0, None)` when nothing was ever saved.
    async fn load(&self) -> Result<(u64, Option<u64>)>;
}

/// Persists log entries above the snapshot boundary.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Remove every entry with index >= `from_index`.
    async fn truncate_suffix(&self, from_index: u64) -> Result<()>;

    /// Remove every entry with index <= `up_to_index`.
    async fn compact_prefix(&self, up_to_index: u64) -> Result<()>;

    /// All stored entries in index order.
    async fn get_all(&self) -> Result<Vec<LogEntry>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    async fn load(&self) -> Result<Option<Snapshot>>;
}

/// The replicated application.
///
/// `apply` receives committed entries in index order, including no-op and
/// configuration entries; implementations skip what they do not understand.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, entries: &[LogEntry]) -> Result<()>;

    async fn create_snapshot(&self) -> Result<Vec<u8>>;

    async fn restore_snapshot(&self, data: &[u8]) -> Result<()>;
}
