pub mod action;
pub mod engine;
pub mod executor;
pub mod membership;
pub mod memory;
pub mod message;
pub mod node;
pub mod state;
pub mod storage;
pub mod timer;
pub mod transport;

pub use action::Action;
pub use engine::{Engine, EngineConfig};
pub use executor::{Collaborators, Executor, RaftStatus};
pub use message::{
    ConfigurationChangeRequest, ConfigurationChangeResponse, ConfigurationChangeType, Message,
};
pub use node::RaftNode;
pub use state::{Command, ConfigurationPhase, LogEntry, NodeState, RaftRole};
pub use storage::{LogStore, Snapshot, SnapshotStore, StateMachine, StateStore};
pub use timer::TokioTimers;
pub use transport::{TimerControl, Transport};
