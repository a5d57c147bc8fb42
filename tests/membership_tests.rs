//! Membership change tests.
//!
//! Nodes join and leave through joint consensus; callers wait for the
//! change to commit and learn when leadership is lost mid-change.


use std::collections::BTreeSet;
use std::time::Duration;

use raft_lite::error::RaftError;
use raft_lite::raft::{
    ConfigurationChangeRequest, ConfigurationChangeType, ConfigurationPhase,
};
use test_harness::{assert_eventually, DurableStores, TestCluster};
use tokio_util::sync::CancellationToken;

/// A fourth node joins and every node ends up on the new configuration
#[tokio::test]
async fn test_add_node_commits_new_configuration() {
    let mut cluster = TestCluster::new(3).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let before = cluster.propose(b"before-join").await.expect("accepted");
    assert!(cluster.wait_for_applied_on_all(before, Duration::from_secs(2)).await);

    // The joining node starts out knowing the old members and itself
    cluster.start_node(4, &[1, 2, 3, 4], DurableStores::default());

    let resp = cluster
        .change_membership(ConfigurationChangeType::AddNode, 4, Duration::from_secs(5))
        .await
        .expect("change should finish");
    assert!(resp.success, "change failed: {:?}", resp.reason);
    assert!(resp.committed);

    let all = BTreeSet::from([1, 2, 3, 4]);
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                let status = node.status().await;
                if status.cluster_members != all
                    || status.configuration_phase != ConfigurationPhase::None
                {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(3),
        "All nodes should adopt the four-node configuration",
    )
    .await;

    // The new node received the history and takes part in commits
    let after = cluster.propose(b"after-join").await.expect("accepted");
    assert!(cluster.wait_for_applied_on_all(after, Duration::from_secs(3)).await);
    assert_eq!(
        cluster.node(4).applied_data(),
        vec![b"before-join".to_vec(), b"after-join".to_vec()]
    );

    cluster.shutdown().await;
}

/// Removing a follower shrinks the configuration without disturbing the leader
#[tokio::test]
async fn test_remove_follower_keeps_leader_stable() {
    let cluster = TestCluster::new(4).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(2)).await);

    let removed = cluster
        .active_node_ids()
        .into_iter()
        .rev()
        .find(|&id| id != leader_id)
        .expect("a follower");
    let resp = cluster
        .change_membership(ConfigurationChangeType::RemoveNode, removed, Duration::from_secs(5))
        .await
        .expect("change should finish");
    assert!(resp.success, "change failed: {:?}", resp.reason);
    assert!(resp.committed);

    let remaining: BTreeSet<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != removed)
        .collect();
    assert_eq!(cluster.node(leader_id).status().await.cluster_members, remaining);
    let term = cluster.node(leader_id).term().await;

    // The removed node stops hearing heartbeats and no longer campaigns
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cluster.get_leader_id().await, Some(leader_id));
    assert_eq!(cluster.node(leader_id).term().await, term);

    let index = cluster.propose(b"after-removal").await.expect("accepted");
    assert_eventually(
        || async {
            for &id in &remaining {
                if cluster.node(id).last_applied().await < index {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(3),
        "Remaining members should apply new commands",
    )
    .await;

    cluster.shutdown().await;
}

/// Invalid requests are rejected without touching the log
#[tokio::test]
async fn test_invalid_changes_rejected() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let last_log_index = cluster.node(leader_id).status().await.last_log_index;

    let cases = [
        (ConfigurationChangeType::AddNode, 2, "node is already a member"),
        (ConfigurationChangeType::RemoveNode, 9, "node is not a member"),
        (
            ConfigurationChangeType::RemoveNode,
            leader_id,
            "removal would shrink the cluster below 3 members",
        ),
        (ConfigurationChangeType::AddNode, 0, "malformed target node id"),
    ];
    for (change_type, target, reason) in cases {
        let resp = cluster
            .change_membership(change_type, target, Duration::from_secs(1))
            .await
            .expect("rejection is a response");
        assert!(!resp.success);
        assert_eq!(resp.reason.as_deref(), Some(reason));
        assert_eq!(resp.leader_hint, Some(leader_id));
    }
    assert_eq!(
        cluster.node(leader_id).status().await.last_log_index,
        last_log_index
    );

    cluster.shutdown().await;
}

/// A follower refuses to run a membership change
#[tokio::test]
async fn test_change_on_follower_rejected() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .expect("a follower");

    let resp = cluster
        .node(follower_id)
        .executor
        .change_configuration(
            ConfigurationChangeRequest {
                change_type: ConfigurationChangeType::AddNode,
                target_node_id: 7,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("rejection is a response");
    assert!(!resp.success);
    assert_eq!(resp.reason.as_deref(), Some("not leader"));

    cluster.shutdown().await;
}

/// A leader cut off mid-change reports the loss of leadership once it
/// learns of the new term
#[tokio::test]
async fn test_waiter_fails_when_leadership_lost() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(2)).await);

    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != leader_id)
        .collect();
    cluster.isolate_node(leader_id);

    let cancel = CancellationToken::new();
    let change = cluster.node(leader_id).executor.change_configuration(
        ConfigurationChangeRequest {
            change_type: ConfigurationChangeType::AddNode,
            target_node_id: 4,
        },
        &cancel,
    );
    let takeover = async {
        let new_leader = cluster
            .wait_for_leader_in_group(&others, Duration::from_secs(5))
            .await;
        cluster.heal_partition();
        new_leader
    };
    let (result, new_leader) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(change, takeover)
    })
    .await
    .expect("change should settle");

    assert!(new_leader.is_some(), "Majority should elect a new leader");
    let resp = result.expect("waiter should resolve with a response");
    assert!(!resp.success);
    assert!(!resp.committed);
    assert_eq!(resp.reason.as_deref(), Some("leadership lost"));

    // The uncommitted joint entry is gone from the old leader
    assert_eventually(
        || async {
            let status = cluster.node(leader_id).status().await;
            status.configuration_phase == ConfigurationPhase::None
                && status.cluster_members == BTreeSet::from([1, 2, 3])
        },
        Duration::from_secs(3),
        "Old leader should drop the abandoned change",
    )
    .await;

    cluster.shutdown().await;
}

/// Cancelling the wait leaves the change running but returns to the caller
#[tokio::test]
async fn test_cancelled_wait_returns_cancelled() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(2)).await);

    // Cut off from its followers the leader cannot commit the joint entry
    cluster.isolate_node(leader_id);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let result = cluster
        .node(leader_id)
        .executor
        .change_configuration(
            ConfigurationChangeRequest {
                change_type: ConfigurationChangeType::AddNode,
                target_node_id: 4,
            },
            &cancel,
        )
        .await;
    assert!(matches!(result, Err(RaftError::Cancelled)));

    let status = cluster.node(leader_id).status().await;
    assert_eq!(status.configuration_phase, ConfigurationPhase::Joint);

    cluster.shutdown().await;
}
