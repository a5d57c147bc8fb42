//! Quorum arithmetic.
//!
//! Outside a membership change a quorum is a strict majority of
//! `cluster_members`. While a change is in flight (joint or finalizing), the
//! old and the new member sets must each reach a majority on their own.

use std::collections::BTreeSet;

use crate::raft::state::{ConfigurationPhase, NodeState};

/// Smallest number of members forming a strict majority.
pub fn majority(members: &BTreeSet<u64>) -> usize {
    members.len() / 2 + 1
}

fn has_majority(members: &BTreeSet<u64>, counts: impl Fn(u64) -> bool) -> bool {
    members.iter().filter(|&&id| counts(id)).count() >= majority(members)
}

fn quorum_by(state: &NodeState, counts: impl Fn(u64) -> bool) -> bool {
    match state.configuration_phase {
        ConfigurationPhase::None => has_majority(&state.cluster_members, &counts),
        ConfigurationPhase::Joint | ConfigurationPhase::Finalizing => {
            has_majority(&state.old_configuration_members, &counts)
                && has_majority(&state.new_configuration_members, &counts)
        }
    }
}

/// Whether `granted` forms a quorum under the node's current phase.
pub fn has_quorum(state: &NodeState, granted: &BTreeSet<u64>) -> bool {
    quorum_by(state, |id| granted.contains(&id))
}

/// Whether a quorum of `match_index` values has reached `index`.
pub fn is_replicated_by_quorum(state: &NodeState, index: u64) -> bool {
    quorum_by(state, |id| {
        state
            .match_index
            .get(&id)
            .is_some_and(|&matched| matched >= index)
    })
}

/// Every node whose vote or acknowledgement can count toward a quorum.
pub fn voting_members(state: &NodeState) -> BTreeSet<u64> {
    match state.configuration_phase {
        ConfigurationPhase::None => state.cluster_members.clone(),
        ConfigurationPhase::Joint | ConfigurationPhase::Finalizing => state
            .old_configuration_members
            .union(&state.new_configuration_members)
            .copied()
            .collect(),
    }
}

/// Voting members other than this node, in ascending id order.
pub fn peers(state: &NodeState) -> Vec<u64> {
    voting_members(state)
        .into_iter()
        .filter(|&id| id != state.node_id)
        .collect()
}
