use async_trait::async_trait;

use crate::error::Result;
use crate::raft::message::Message;

/// Request/response delivery to peers.
///
/// `send` resolves with the peer's reply. The executor bounds every call with
/// the configured RPC timeout, so an implementation may simply never answer a
/// lost message.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: u64, message: Message) -> Result<Message>;
}

/// Re-arms the node's timers.
///
/// Called with the gate held; implementations must not block or call back
/// into the executor.
pub trait TimerControl: Send + Sync {
    fn reset_election_timer(&self);

    fn reset_heartbeat_timer(&self);
}
