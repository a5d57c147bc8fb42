use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::raft::executor::Executor;
use crate::raft::message::Message;
use crate::raft::timer::{random_election_timeout, TokioTimers};

/// Drives an [`Executor`] from wall-clock timers.
///
/// The executor never reads the clock itself; this loop turns the randomized
/// election timeout and the fixed heartbeat interval into
/// `ElectionTimeoutElapsed` / `HeartbeatTimeoutElapsed` messages.
pub struct RaftNode {
    pub id: u64,
    executor: Arc<Executor>,
    timers: Arc<TokioTimers>,
}

impl RaftNode {
    /// `timers` must be the same `TokioTimers` the executor was built with.
    pub fn new(executor: Arc<Executor>, timers: Arc<TokioTimers>) -> Self {
        Self {
            id: executor.node_id(),
            executor,
            timers,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Initialize the executor, then run the timer loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.executor.initialize().await?;

        let config = self.executor.config();
        let (min_ms, max_ms) = (
            config.election_timeout_min_ms,
            config.election_timeout_max_ms,
        );
        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms);

        let mut election_deadline = Instant::now() + random_election_timeout(min_ms, max_ms);
        let mut heartbeat_deadline = Instant::now() + heartbeat_interval;

        loop {
            let tick = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, "Raft node shutting down");
                    return Ok(());
                }

                _ = self.timers.election_reset.notified() => {
                    election_deadline = Instant::now() + random_election_timeout(min_ms, max_ms);
                    None
                }

                _ = self.timers.heartbeat_reset.notified() => {
                    heartbeat_deadline = Instant::now() + heartbeat_interval;
                    None
                }

                _ = sleep_until(election_deadline) => {
                    tracing::debug!(node_id = self.id, "Election timeout elapsed");
                    election_deadline = Instant::now() + random_election_timeout(min_ms, max_ms);
                    Some(Message::ElectionTimeoutElapsed)
                }

                _ = sleep_until(heartbeat_deadline) => {
                    heartbeat_deadline = Instant::now() + heartbeat_interval;
                    Some(Message::HeartbeatTimeoutElapsed)
                }
            };

            // Run outside the select so shutdown never interrupts a tick midway.
            if let Some(message) = tick {
                let name = message.name();
                if let Err(e) = self.executor.handle(message).await {
                    tracing::error!(node_id = self.id, message = name, error = %e, "Timer tick failed");
                }
            }
        }
    }
}
