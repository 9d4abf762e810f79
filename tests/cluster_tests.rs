//! Multi-agent sharding scenarios over real gRPC.


use std::sync::Arc;
use std::time::Duration;

use configshard::agent::Agent;
use configshard::cluster::{GrpcPeerNotifier, NodeState, PeerNotifier};
use configshard::config::NodeConfig;
use configshard::error::ClusterError;
use configshard::instance::IdleInstanceFactory;
use configshard::store::{KvClient, MemoryKv};
use test_harness::{assert_eventually, test_node_config, TestCluster};

/// Pushes the periodic refresh out of every test's lifetime.
fn without_periodic_refresh(config: &mut NodeConfig) {
    config.cluster.reshard_interval_ms = 3_600_000;
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("job-{i}")).collect()
}

/// A single agent joining an empty ring picks up a config already stored.
#[tokio::test]
async fn single_agent_runs_existing_config() {
    let mut cluster = TestCluster::new(23100).await;
    cluster.put("job1").await;

    let agent = cluster.start_agent("a").await;
    assert_eq!(agent.node().state(), NodeState::Joined);

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            async move { cluster_ref.trackers("job1").await == vec!["a"] && cluster_ref.runners("job1").await == vec!["a"] }
        },
        Duration::from_secs(2),
        "job1 should run on the only agent",
    )
    .await;

    cluster.shutdown().await;
}

/// When a second agent joins, the configs it now owns move off the first one
/// and every config runs exactly once.
#[tokio::test]
async fn joining_agent_takes_over_its_share() {
    let mut cluster = TestCluster::new(23200).await;
    let keys = keys(20);
    for key in &keys {
        cluster.put(key).await;
    }

    cluster.start_agent("a").await;
    assert_eq!(cluster.agent("a").reconciler().tracked().await.len(), keys.len());

    cluster.start_agent("b").await;

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            let keys_ref = &keys;
            async move { cluster_ref.single_ownership(keys_ref).await }
        },
        Duration::from_secs(5),
        "every config should run on exactly one agent",
    )
    .await;

    // Whoever tracks a key is the agent the ring names as its owner.
    for key in &keys {
        let owner = cluster.agent("a").node().membership().owner(key).unwrap();
        let tracker = &cluster.trackers(key).await[0];
        assert_eq!(owner.addr, cluster.agent(tracker).config().lifecycler.advertise_addr);
    }
    assert!(
        !cluster.agent("b").reconciler().tracked().await.is_empty(),
        "the joining agent should own part of the pool"
    );

    cluster.shutdown().await;
}

/// Deleting a config stops it on its owner.
#[tokio::test]
async fn deleted_config_is_stopped_on_owner() {
    let mut cluster = TestCluster::new(23300).await;
    cluster.put("job3").await;
    cluster.start_agent("a").await;
    cluster.start_agent("b").await;

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            async move { cluster_ref.trackers("job3").await.len() == 1 }
        },
        Duration::from_secs(5),
        "job3 should be owned by one agent",
    )
    .await;

    cluster.store.delete("job3").await.unwrap();

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            async move { cluster_ref.trackers("job3").await.is_empty() && cluster_ref.runners("job3").await.is_empty() }
        },
        Duration::from_secs(2),
        "job3 should stop after deletion",
    )
    .await;

    cluster.shutdown().await;
}

/// A config stored while the fleet is running lands on exactly one agent.
#[tokio::test]
async fn new_config_is_picked_up_by_one_agent() {
    let mut cluster = TestCluster::new(23400).await;
    cluster.start_agent("a").await;
    cluster.start_agent("b").await;

    cluster.put("late").await;

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            async move { cluster_ref.single_ownership(&["late".to_string()]).await }
        },
        Duration::from_secs(2),
        "late config should run on exactly one agent",
    )
    .await;

    cluster.shutdown().await;
}

/// A leaving agent hands every config it ran to the remaining agents.
#[tokio::test]
async fn leaving_agent_hands_off_its_configs() {
    let mut cluster = TestCluster::new(23500).await;
    let keys = keys(10);
    for key in &keys {
        cluster.put(key).await;
    }
    cluster.start_agent("a").await;
    cluster.start_agent("b").await;

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            let keys_ref = &keys;
            async move { cluster_ref.single_ownership(keys_ref).await }
        },
        Duration::from_secs(5),
        "every config should run on exactly one agent",
    )
    .await;

    cluster.stop_agent("a").await;

    assert_eventually(
        || {
            let cluster_ref = &cluster;
            let keys_ref = &keys;
            async move {
                let tracked = cluster_ref.agent("b").reconciler().tracked().await;
                keys_ref.iter().all(|k| tracked.contains(k))
            }
        },
        Duration::from_secs(2),
        "the remaining agent should run every config",
    )
    .await;

    assert_eq!(cluster.agent("b").manager().list_configs().await.len(), keys.len());
    cluster.shutdown().await;
}

/// An agent that left stops everything it ran.
#[tokio::test]
async fn stopped_agent_runs_nothing() {
    let mut cluster = TestCluster::new(23600).await;
    cluster.put("job5").await;
    cluster.start_agent("a").await;
    assert_eq!(cluster.trackers("job5").await, vec!["a"]);

    let agent = cluster.agents.remove("a").unwrap();
    agent.shutdown().await;

    assert_eq!(agent.node().state(), NodeState::Left);
    assert!(agent.reconciler().tracked().await.is_empty());
    assert!(agent.manager().list_configs().await.is_empty());
    cluster.shutdown().await;
}

/// The join protocol alone hands configs over: once the joining agent's
/// start returns, every config already runs on exactly its ring owner.
#[tokio::test]
async fn join_hands_off_configs_without_periodic_refresh() {
    let mut cluster = TestCluster::new(23800).await;
    let keys = keys(20);
    for key in &keys {
        cluster.put(key).await;
    }

    cluster.start_agent_with("a", without_periodic_refresh).await;
    cluster.start_agent_with("b", without_periodic_refresh).await;

    assert!(cluster.single_ownership(&keys).await, "join did not converge ownership");
    for key in &keys {
        let owner = cluster.agent("b").node().membership().owner(key).unwrap();
        let tracker = &cluster.trackers(key).await[0];
        assert_eq!(owner.addr, cluster.agent(tracker).config().lifecycler.advertise_addr);
    }

    cluster.shutdown().await;
}

/// Overlapping reshards, local and over gRPC, serialize on the reconciler and
/// leave the tracked set matching what the instance manager runs.
#[tokio::test]
async fn concurrent_reshards_keep_tracking_consistent() {
    let mut cluster = TestCluster::new(23900).await;
    let keys = keys(10);
    for key in &keys {
        cluster.put(key).await;
    }
    cluster.start_agent_with("a", without_periodic_refresh).await;
    cluster.start_agent_with("b", without_periodic_refresh).await;

    let notifier = Arc::new(GrpcPeerNotifier::new(Duration::from_secs(5)));
    let grpc_addr = cluster.agent("a").config().grpc_addr.to_string();
    let mut reshards = tokio::task::JoinSet::new();
    for i in 0..8 {
        if i % 2 == 0 {
            let reconciler = cluster.agent("a").reconciler().clone();
            reshards.spawn(async move { reconciler.refresh().await.is_ok() });
        } else {
            let notifier = notifier.clone();
            let addr = grpc_addr.clone();
            reshards.spawn(async move { notifier.notify_reshard(&addr).await.is_ok() });
        }
    }
    while let Some(ok) = reshards.join_next().await {
        assert!(ok.unwrap(), "reshard failed");
    }

    for id in ["a", "b"] {
        let agent = cluster.agent(id);
        let mut running: Vec<String> = agent.manager().list_configs().await.into_keys().collect();
        running.sort();
        assert_eq!(agent.reconciler().tracked().await, running);
    }
    assert!(cluster.single_ownership(&keys).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn zero_reshard_interval_is_rejected() {
    let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
    let mut config = test_node_config("a", 24000, 24001);
    config.cluster.reshard_interval_ms = 0;

    let result = Agent::with_kv(config, kv, Arc::new(IdleInstanceFactory)).await;
    assert!(matches!(result, Err(ClusterError::InvalidConfig(_))));
}
