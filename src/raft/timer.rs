use rand::Rng;
use std::time::Duration;
use tokio::sync::Notify;

use crate::raft::transport::TimerControl;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Timer resets delivered to a running [`RaftNode`](crate::raft::RaftNode).
///
/// A reset issued while the node loop is busy is remembered as a single
/// pending permit, so none are lost.
#[derive(Debug, Default)]
pub struct TokioTimers {
    pub(crate) election_reset: Notify,
    pub(crate) heartbeat_reset: Notify,
}

impl TokioTimers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerControl for TokioTimers {
    fn reset_election_timer(&self) {
        self.election_reset.notify_one();
    }

    fn reset_heartbeat_timer(&self) {
        self.heartbeat_reset.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_election_timeout_in_range() {
        for _ in 0..100 {
            let timeout = random_election_timeout(150, 300);
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_fixed_range() {
        assert_eq!(random_election_timeout(80, 80), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_reset_before_wait_is_not_lost() {
        let timers = TokioTimers::new();
        timers.reset_election_timer();
        tokio::time::timeout(Duration::from_millis(50), timers.election_reset.notified())
            .await
            .expect("pending reset should be observed");
    }
}
