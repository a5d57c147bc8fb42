use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use raft_lite::config::RaftConfig;
use raft_lite::error::RaftError;
use raft_lite::raft::memory::{
    MemLogStore, MemNetwork, MemSnapshotStore, MemStateMachine, MemStateStore,
};
use raft_lite::raft::{
    Collaborators, ConfigurationChangeRequest, ConfigurationChangeType, Executor, RaftNode,
    RaftRole, RaftStatus, TokioTimers,
};

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "Run an in-process Raft cluster and replicate a batch of commands")]
struct Args {
    /// Number of nodes in the initial cluster
    #[arg(long, default_value = "3")]
    nodes: u64,

    /// Number of client commands to replicate
    #[arg(long, default_value = "10")]
    commands: u64,

    /// Disable the PreVote round before elections
    #[arg(long)]
    no_pre_vote: bool,

    /// Add one more node through a joint-consensus membership change
    #[arg(long)]
    add_node: bool,

    /// Take a snapshot once the log holds more than this many entries
    #[arg(long, default_value = "1000")]
    snapshot_threshold: usize,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct DemoOutput {
    leader_id: u64,
    read_index: Option<u64>,
    nodes: Vec<RaftStatus>,
}

struct DemoNode {
    executor: Arc<Executor>,
    state_machine: Arc<MemStateMachine>,
    task: JoinHandle<()>,
}

fn start_node(
    network: &Arc<MemNetwork>,
    config: RaftConfig,
    shutdown: &CancellationToken,
) -> Result<DemoNode, RaftError> {
    let node_id = config.node_id;
    let timers = Arc::new(TokioTimers::new());
    let state_machine = Arc::new(MemStateMachine::default());
    let executor = Arc::new(Executor::new(
        config,
        Collaborators {
            state_store: Arc::new(MemStateStore::default()),
            log_store: Arc::new(MemLogStore::default()),
            snapshot_store: Arc::new(MemSnapshotStore::default()),
            state_machine: state_machine.clone(),
            transport: network.transport(node_id),
            timers: timers.clone(),
        },
    )?);
    network.register(&executor);

    let node = RaftNode::new(executor.clone(), timers);
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = node.run(token).await {
            tracing::error!(node_id, error = %e, "Raft node stopped");
        }
    });

    Ok(DemoNode {
        executor,
        state_machine,
        task,
    })
}

/// A token that cancels itself after `after`.
fn deadline(after: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        trigger.cancel();
    });
    token
}

async fn find_leader(nodes: &[DemoNode], timeout: Duration) -> Option<Arc<Executor>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        for node in nodes {
            if node.executor.status().await.role == RaftRole::Leader {
                return Some(node.executor.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    let shutdown = CancellationToken::new();
    let network = MemNetwork::new();
    let members: Vec<u64> = (1..=args.nodes).collect();

    let mut nodes = Vec::new();
    for &node_id in &members {
        let config = RaftConfig::new(node_id, members.iter().copied())
            .with_pre_vote(!args.no_pre_vote)
            .with_snapshot_threshold(args.snapshot_threshold);
        nodes.push(start_node(&network, config, &shutdown)?);
    }

    let mut leader = find_leader(&nodes, Duration::from_secs(5))
        .await
        .ok_or("no leader elected within 5s")?;
    tracing::info!(leader_id = leader.node_id(), "Leader elected");

    let mut last_index = 0;
    for i in 0..args.commands {
        let resp = leader.propose(format!("cmd-{}", i).into_bytes()).await?;
        if resp.success {
            last_index = resp.index.unwrap_or(last_index);
            continue;
        }
        // Leadership moved; retry once against the new leader
        leader = find_leader(&nodes, Duration::from_secs(5))
            .await
            .ok_or("leadership lost and no new leader elected")?;
        let resp = leader.propose(format!("cmd-{}", i).into_bytes()).await?;
        last_index = resp.index.unwrap_or(last_index);
    }

    let wait = deadline(Duration::from_secs(5));
    leader.wait_applied(last_index, &wait).await?;

    if args.add_node {
        let new_id = args.nodes + 1;
        let joined: Vec<u64> = members.iter().copied().chain([new_id]).collect();
        let config = RaftConfig::new(new_id, joined)
            .with_pre_vote(!args.no_pre_vote)
            .with_snapshot_threshold(args.snapshot_threshold);
        nodes.push(start_node(&network, config, &shutdown)?);

        let resp = leader
            .change_configuration(
                ConfigurationChangeRequest {
                    change_type: ConfigurationChangeType::AddNode,
                    target_node_id: new_id,
                },
                &deadline(Duration::from_secs(10)),
            )
            .await?;
        tracing::info!(
            node_id = new_id,
            success = resp.success,
            reason = ?resp.reason,
            "Membership change finished"
        );
    }

    let read = leader.read_index().await?;
    let read_index = read.success.then_some(read.read_index);

    // Give followers a moment to apply what the leader has committed
    for node in &nodes {
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            node.executor.wait_applied(last_index, &wait),
        )
        .await;
    }

    let mut statuses = Vec::new();
    for node in &nodes {
        statuses.push(node.executor.status().await);
    }

    match args.output {
        OutputFormat::Json => {
            let output = DemoOutput {
                leader_id: leader.node_id(),
                read_index,
                nodes: statuses,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Cluster Status");
            println!("{}", "=".repeat(40));
            println!("Leader:     Node {}", leader.node_id());
            match read_index {
                Some(index) => println!("Read index: {}", index),
                None => println!("Read index: not confirmed"),
            }
            println!();
            println!(
                "{:<6} {:<10} {:<6} {:<8} {:<8} {:<10} MEMBERS",
                "ID", "ROLE", "TERM", "COMMIT", "APPLIED", "COMMANDS"
            );
            println!("{}", "-".repeat(70));
            for (status, node) in statuses.iter().zip(&nodes) {
                println!(
                    "{:<6} {:<10} {:<6} {:<8} {:<8} {:<10} {:?}",
                    status.node_id,
                    status.role.to_string(),
                    status.current_term,
                    status.commit_index,
                    status.last_applied,
                    node.state_machine.applied_data().len(),
                    status.cluster_members
                );
            }
        }
    }

    shutdown.cancel();
    for node in nodes {
        let _ = node.task.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_tokens_are_independent() {
        let batch = deadline(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let change = deadline(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(batch.is_cancelled());
        assert!(!change.is_cancelled());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(change.is_cancelled());
    }
}
