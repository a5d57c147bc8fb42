//! Network partition tests for Raft cluster behavior.
//!
//! These tests verify correct behavior when the network is partitioned:
//! majority elects a leader, minority cannot, PreVote keeps an isolated
//! node from disrupting the cluster, and logs converge after healing.


use std::time::Duration;

use test_harness::{assert_eventually, TestCluster};

/// Split `ids` in two, the first group holding the leader and `leader_side` nodes in total
fn split_with_leader(leader_id: u64, ids: &[u64], leader_side: usize) -> (Vec<u64>, Vec<u64>) {
    let mut with_leader = vec![leader_id];
    let mut rest = Vec::new();
    for &id in ids {
        if id == leader_id {
            continue;
        }
        if with_leader.len() < leader_side {
            with_leader.push(id);
        } else {
            rest.push(id);
        }
    }
    (with_leader, rest)
}

/// Majority partition elects a leader
#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    // Put the leader on the minority side so the majority must elect anew
    let others: Vec<u64> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|&id| id != leader_id)
        .collect();
    let minority = vec![leader_id, others[0]];
    let majority = others[1..].to_vec();
    cluster.create_partition(&majority, &minority);

    let leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await;
    assert!(leader.is_some(), "Majority partition should elect a leader");

    cluster.shutdown().await;
}

/// Minority partition cannot commit even with a stale leader
#[tokio::test]
async fn test_minority_partition_cannot_commit() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    assert!(cluster.wait_for_applied_on_all(1, Duration::from_secs(2)).await);

    // Leader cut off with one follower: it may accept but must not commit
    let ids = cluster.active_node_ids();
    let (stale_side, other_side) = split_with_leader(leader_id, &ids, 2);
    cluster.create_partition(&stale_side, &other_side);

    let stale = cluster.node(leader_id);
    let commit_before = stale.commit_index().await;
    let resp = stale
        .executor
        .propose(b"doomed".to_vec())
        .await
        .expect("propose should not error");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        stale.commit_index().await,
        commit_before,
        "Minority side must not advance the commit index"
    );
    if resp.success {
        assert!(stale.applied_data().is_empty());
    }

    cluster.shutdown().await;
}

/// An isolated follower with PreVote never bumps the cluster's term
#[tokio::test]
async fn test_pre_vote_isolated_follower_does_not_disrupt() {
    let cluster = TestCluster::new(3).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let term = cluster.node(leader_id).term().await;

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .expect("a follower");
    cluster.isolate_node(follower_id);

    // Several election timeouts pass on the isolated node
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        cluster.node(follower_id).term().await,
        term,
        "PreVote should keep the isolated node from raising its term"
    );

    cluster.heal_partition();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(cluster.get_leader_id().await, Some(leader_id));
    for node in cluster.nodes.values() {
        assert_eq!(node.term().await, term, "node {}", node.node_id);
    }

    cluster.shutdown().await;
}

/// Without PreVote an isolated follower inflates its term
#[tokio::test]
async fn test_isolated_follower_without_pre_vote_raises_term() {
    let config = TestCluster::fast_config().with_pre_vote(false);
    let cluster = TestCluster::with_config(3, config).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let term = cluster.node(leader_id).term().await;

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .expect("a follower");
    cluster.isolate_node(follower_id);

    let follower = cluster.node(follower_id);
    assert_eventually(
        || async { follower.term().await > term + 1 },
        Duration::from_secs(2),
        "Isolated node should keep starting elections",
    )
    .await;

    cluster.shutdown().await;
}

/// Logs converge after the partition heals
#[tokio::test]
async fn test_logs_converge_after_heal() {
    let cluster = TestCluster::new(5).await;
    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let ids = cluster.active_node_ids();
    let (majority, minority) = split_with_leader(leader_id, &ids, 3);
    cluster.create_partition(&majority, &minority);

    let mut last_index = 0;
    for i in 0..5 {
        last_index = cluster
            .node(leader_id)
            .executor
            .propose(format!("during-partition-{}", i).into_bytes())
            .await
            .expect("propose")
            .index
            .expect("leader should accept");
    }

    assert_eventually(
        || async {
            for &id in &majority {
                if cluster.node(id).last_applied().await < last_index {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(3),
        "Majority should apply the commands",
    )
    .await;
    for &id in &minority {
        assert!(cluster.node(id).last_applied().await < last_index);
    }

    cluster.heal_partition();
    assert!(
        cluster
            .wait_for_applied_on_all(last_index, Duration::from_secs(5))
            .await,
        "Minority should catch up after healing"
    );
    assert!(cluster.verify_applied_consistency());

    cluster.shutdown().await;
}

/// At most one leader per term across repeated partitions
#[tokio::test]
async fn test_election_safety_under_repeated_partitions() {
    let cluster = TestCluster::new(5).await;
    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let layouts: [(&[u64], &[u64]); 4] = [
        (&[1, 2, 3], &[4, 5]),
        (&[3, 4, 5], &[1, 2]),
        (&[1, 4], &[2, 3, 5]),
        (&[2, 5, 1], &[3, 4]),
    ];
    let mut seen: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
    for (a, b) in layouts {
        cluster.create_partition(a, b);
        for _ in 0..15 {
            for (term, leaders) in cluster.leaders_by_term().await {
                assert_eq!(leaders.len(), 1, "term {} has leaders {:?}", term, leaders);
                let previous = seen.insert(term, leaders[0]);
                assert!(
                    previous.is_none() || previous == Some(leaders[0]),
                    "term {} led by {:?} and {}",
                    term,
                    previous,
                    leaders[0]
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    cluster.heal_partition();
    assert!(cluster.wait_for_leader(Duration::from_secs(5)).await.is_some());

    cluster.shutdown().await;
}
