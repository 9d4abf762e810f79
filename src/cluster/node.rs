use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::Counter;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::cluster::backoff;
use crate::cluster::client::PeerNotifier;
use crate::cluster::membership::MembershipView;
use crate::cluster::ring::RingError;
use crate::config::{BackoffConfig, ClusterConfig};
use crate::error::{ClusterError, Result};
use crate::observability::MetricsRegistry;

/// Something that can recompute local ownership on demand.
///
/// Injected into [`ClusterNode`] so the node can trigger a local refresh
/// without holding the reconciler itself.
#[async_trait]
pub trait ReshardHandler: Send + Sync {
    async fn reshard(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    NotJoined,
    Joining,
    Joined,
    Leaving,
    Left,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::NotJoined => write!(f, "not_joined"),
            NodeState::Joining => write!(f, "joining"),
            NodeState::Joined => write!(f, "joined"),
            NodeState::Leaving => write!(f, "leaving"),
            NodeState::Left => write!(f, "left"),
        }
    }
}

#[derive(Clone)]
struct NotifyMetrics {
    success: Counter,
    failure: Counter,
}

impl NotifyMetrics {
    fn new(registry: &MetricsRegistry) -> Self {
        let counter = |result: &str| {
            registry.counter(
                "agent_cluster_peer_notifications_total",
                "Reshard notifications sent to peers",
                &[("result", result.to_string())],
            )
        };
        Self {
            success: counter("success"),
            failure: counter("failure"),
        }
    }
}

/// Membership lifecycle of this process and the peer reshard protocol.
///
/// Joining registers in the ring, asks every other healthy peer to reshard,
/// then reshards locally. Leaving deregisters and asks the remaining peers to
/// pick up what this node owned.
pub struct ClusterNode {
    membership: Arc<dyn MembershipView>,
    notifier: Arc<dyn PeerNotifier>,
    handler: Arc<dyn ReshardHandler>,
    backoff: BackoffConfig,
    cluster_notify_timeout: Duration,
    state: RwLock<NodeState>,
    metrics: NotifyMetrics,
}

impl ClusterNode {
    pub fn new(
        membership: Arc<dyn MembershipView>,
        notifier: Arc<dyn PeerNotifier>,
        handler: Arc<dyn ReshardHandler>,
        config: &ClusterConfig,
        registry: &MetricsRegistry,
    ) -> Self {
        Self {
            membership,
            notifier,
            handler,
            backoff: config.backoff.clone(),
            cluster_notify_timeout: config.cluster_notify_timeout(),
            state: RwLock::new(NodeState::NotJoined),
            metrics: NotifyMetrics::new(registry),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Joined
    }

    pub fn membership(&self) -> &Arc<dyn MembershipView> {
        &self.membership
    }

    fn set_state(&self, state: NodeState) {
        let prev = std::mem::replace(&mut *self.state.write(), state);
        tracing::info!(from = %prev, to = %state, "Node state changed");
    }

    /// Move from `from` to `to` in one step. Returns the current state if it
    /// is not `from`.
    fn transition(&self, from: NodeState, to: NodeState) -> std::result::Result<(), NodeState> {
        {
            let mut state = self.state.write();
            if *state != from {
                return Err(*state);
            }
            *state = to;
        }
        tracing::info!(from = %from, to = %to, "Node state changed");
        Ok(())
    }

    /// Join the cluster.
    ///
    /// Failing to register aborts the join and leaves the node `NotJoined`.
    /// Peer notification failures and a failed local reshard are logged; the
    /// periodic refresh recovers from both.
    pub async fn join(&self) -> Result<()> {
        if let Err(current) = self.transition(NodeState::NotJoined, NodeState::Joining) {
            return match current {
                NodeState::Joined => Ok(()),
                NodeState::Joining => Err(ClusterError::Internal("join already in progress".to_string())),
                _ => Err(ClusterError::AlreadyLeft),
            };
        }

        if let Err(e) = self.membership.register_self().await {
            tracing::error!(error = %e, "Failed to register in ring, aborting join");
            self.set_state(NodeState::NotJoined);
            return Err(e.into());
        }

        self.notify_peers().await;

        if let Err(e) = self.handler.reshard().await {
            tracing::error!(error = %e, "Local reshard after join failed");
        }

        self.set_state(NodeState::Joined);
        Ok(())
    }

    /// Leave the cluster. Only used for graceful shutdown.
    ///
    /// No local reshard runs: the local instances are about to be torn down.
    pub async fn leave(&self) -> Result<()> {
        if let Err(current) = self.transition(NodeState::Joined, NodeState::Leaving) {
            return Err(match current {
                NodeState::NotJoined | NodeState::Joining => ClusterError::NotJoined,
                _ => ClusterError::AlreadyLeft,
            });
        }

        if let Err(e) = self.membership.deregister_self().await {
            tracing::error!(error = %e, "Failed to deregister from ring");
        }

        self.notify_peers().await;

        self.set_state(NodeState::Left);
        Ok(())
    }

    /// Ask every healthy peer except this node to reshard. Returns how many
    /// acknowledged.
    ///
    /// Each peer is retried with backoff independently; the whole broadcast is
    /// bounded by the cluster notification timeout.
    pub async fn notify_peers(&self) -> usize {
        if let Err(e) = self.membership.sync().await {
            tracing::warn!(error = %e, "Failed to refresh ring before notifying peers");
        }

        let peers = match self.membership.all_healthy() {
            Ok(peers) => peers,
            Err(RingError::Empty) => {
                tracing::info!("No healthy peers to notify");
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list healthy peers");
                return 0;
            }
        };

        let mut notifications = JoinSet::new();
        for peer in peers.into_iter().filter(|p| !self.membership.is_self(p)) {
            let notifier = self.notifier.clone();
            let policy = self.backoff.clone();
            let metrics = self.metrics.clone();
            notifications.spawn(async move {
                let result =
                    backoff::retry(&policy, "notify peer", || notifier.notify_reshard(&peer.addr)).await;
                match result {
                    Ok(()) => {
                        metrics.success.increment(1);
                        tracing::debug!(peer = %peer.addr, "Peer resharded");
                        true
                    }
                    Err(status) => {
                        metrics.failure.increment(1);
                        tracing::warn!(peer = %peer.addr, error = %status, "Failed to notify peer to reshard");
                        false
                    }
                }
            });
        }

        let total = notifications.len();
        let mut acknowledged = 0;
        let drained = tokio::time::timeout(self.cluster_notify_timeout, async {
            while let Some(joined) = notifications.join_next().await {
                if matches!(joined, Ok(true)) {
                    acknowledged += 1;
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                timeout = ?self.cluster_notify_timeout,
                pending = notifications.len(),
                "Timed out notifying peers"
            );
            notifications.abort_all();
        }

        tracing::info!(notified = acknowledged, peers = total, "Cluster reshard notification complete");
        acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tonic::Status;

    use crate::cluster::ring::Peer;

    struct StaticMembership {
        self_addr: String,
        peers: parking_lot::Mutex<Vec<String>>,
        fail_register: bool,
    }

    impl StaticMembership {
        fn new(self_addr: &str, others: &[&str], fail_register: bool) -> Self {
            Self {
                self_addr: self_addr.to_string(),
                peers: parking_lot::Mutex::new(others.iter().map(|s| s.to_string()).collect()),
                fail_register,
            }
        }
    }

    #[async_trait]
    impl MembershipView for StaticMembership {
        fn owner(&self, _key: &str) -> std::result::Result<Peer, RingError> {
            Err(RingError::Empty)
        }

        fn all_healthy(&self) -> std::result::Result<Vec<Peer>, RingError> {
            Ok(self
                .peers
                .lock()
                .iter()
                .map(|addr| Peer {
                    addr: addr.clone(),
                    tokens: vec![],
                    healthy: true,
                })
                .collect())
        }

        fn self_addr(&self) -> &str {
            &self.self_addr
        }

        async fn register_self(&self) -> std::result::Result<(), RingError> {
            if self.fail_register {
                return Err(RingError::Empty);
            }
            self.peers.lock().push(self.self_addr.clone());
            Ok(())
        }

        async fn deregister_self(&self) -> std::result::Result<(), RingError> {
            let me = self.self_addr.clone();
            self.peers.lock().retain(|p| *p != me);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: parking_lot::Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl PeerNotifier for RecordingNotifier {
        async fn notify_reshard(&self, addr: &str) -> std::result::Result<(), Status> {
            self.calls.lock().push(addr.to_string());
            if self.failing.contains(addr) {
                return Err(Status::unavailable("down"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReshardHandler for CountingHandler {
        async fn reshard(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            backoff: BackoffConfig {
                min_backoff_ms: 1,
                max_backoff_ms: 2,
                max_retries: 3,
            },
            ..Default::default()
        }
    }

    fn node(
        membership: Arc<StaticMembership>,
        notifier: Arc<RecordingNotifier>,
        handler: Arc<CountingHandler>,
    ) -> ClusterNode {
        ClusterNode::new(membership, notifier, handler, &fast_config(), &MetricsRegistry::new())
    }

    #[tokio::test]
    async fn join_notifies_other_peers_then_reshards_locally() {
        let membership = Arc::new(StaticMembership::new("self:1", &["b:1", "c:1"], false));
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = Arc::new(CountingHandler::default());
        let node = node(membership, notifier.clone(), handler.clone());

        node.join().await.unwrap();

        let mut calls = notifier.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["b:1", "c:1"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.state(), NodeState::Joined);
        assert!(node.is_ready());
    }

    #[tokio::test]
    async fn failing_peer_is_retried_and_does_not_block_join() {
        let membership = Arc::new(StaticMembership::new("self:1", &["b:1", "down:1"], false));
        let notifier = Arc::new(RecordingNotifier {
            failing: HashSet::from(["down:1".to_string()]),
            ..Default::default()
        });
        let handler = Arc::new(CountingHandler::default());
        let node = node(membership, notifier.clone(), handler);

        node.join().await.unwrap();

        let calls = notifier.calls.lock().clone();
        assert_eq!(calls.iter().filter(|c| *c == "down:1").count(), 3);
        assert_eq!(calls.iter().filter(|c| *c == "b:1").count(), 1);
        assert_eq!(node.state(), NodeState::Joined);
    }

    #[tokio::test]
    async fn registration_failure_aborts_join() {
        let membership = Arc::new(StaticMembership::new("self:1", &["b:1"], true));
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = Arc::new(CountingHandler::default());
        let node = node(membership, notifier.clone(), handler.clone());

        assert!(matches!(node.join().await, Err(ClusterError::Ring(_))));
        assert_eq!(node.state(), NodeState::NotJoined);
        assert!(notifier.calls.lock().is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leave_notifies_remaining_peers_without_local_reshard() {
        let membership = Arc::new(StaticMembership::new("self:1", &["b:1"], false));
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = Arc::new(CountingHandler::default());
        let node = node(membership.clone(), notifier.clone(), handler.clone());

        node.join().await.unwrap();
        notifier.calls.lock().clear();

        node.leave().await.unwrap();
        assert_eq!(*notifier.calls.lock(), vec!["b:1"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.state(), NodeState::Left);
        assert!(!membership.peers.lock().contains(&"self:1".to_string()));

        assert!(matches!(node.leave().await, Err(ClusterError::AlreadyLeft)));
        assert!(matches!(node.join().await, Err(ClusterError::AlreadyLeft)));
    }

    /// Holds every local reshard until released.
    #[derive(Default)]
    struct GatedHandler {
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl ReshardHandler for GatedHandler {
        async fn reshard(&self) -> Result<()> {
            self.gate.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_join_is_rejected_while_first_is_in_flight() {
        let membership = Arc::new(StaticMembership::new("self:1", &[], false));
        let handler = Arc::new(GatedHandler::default());
        let node = Arc::new(ClusterNode::new(
            membership,
            Arc::new(RecordingNotifier::default()),
            handler.clone(),
            &fast_config(),
            &MetricsRegistry::new(),
        ));

        let first = {
            let node = node.clone();
            tokio::spawn(async move { node.join().await })
        };
        while node.state() != NodeState::Joining {
            tokio::task::yield_now().await;
        }

        assert!(matches!(node.join().await, Err(ClusterError::Internal(_))));
        assert!(matches!(node.leave().await, Err(ClusterError::NotJoined)));

        handler.gate.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(node.state(), NodeState::Joined);
        node.join().await.unwrap();
    }

    #[tokio::test]
    async fn leave_before_join_fails() {
        let membership = Arc::new(StaticMembership::new("self:1", &[], false));
        let node = node(membership, Arc::new(RecordingNotifier::default()), Arc::new(CountingHandler::default()));
        assert!(matches!(node.leave().await, Err(ClusterError::NotJoined)));
    }
}
