use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ClusterError, Result};
use crate::instance::GlobalConfig;

/// Retry policy for peer notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts per peer, including the first.
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 1_000,
            max_backoff_ms: 120_000,
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Sharding behaviour of this node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// When false, the node runs every config in the store on its own and
    /// never touches the ring.
    pub enabled: bool,
    pub reshard_interval_ms: u64,
    /// Upper bound on a single refresh. Zero disables the bound.
    pub reshard_timeout_ms: u64,
    /// Per-call timeout of a Reshard RPC to a peer.
    pub notify_timeout_ms: u64,
    /// Upper bound on notifying every peer during join or leave.
    pub cluster_notify_timeout_ms: u64,
    /// Accept configs that read files from the agent's filesystem.
    pub allow_local_file_reads: bool,
    pub backoff: BackoffConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            reshard_interval_ms: 60_000,
            reshard_timeout_ms: 30_000,
            notify_timeout_ms: 5_000,
            cluster_notify_timeout_ms: 60_000,
            allow_local_file_reads: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn reshard_interval(&self) -> Duration {
        Duration::from_millis(self.reshard_interval_ms)
    }

    pub fn reshard_timeout(&self) -> Option<Duration> {
        (self.reshard_timeout_ms > 0).then(|| Duration::from_millis(self.reshard_timeout_ms))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn cluster_notify_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_notify_timeout_ms)
    }
}

/// How this node registers itself in the ring.
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// Unique identifier of this node in the ring.
    pub instance_id: String,
    /// host:port peers dial for the Reshard RPC.
    pub advertise_addr: String,
    pub num_tokens: usize,
    pub heartbeat_period_ms: u64,
    /// Entries not heartbeated within this window are unhealthy.
    pub heartbeat_timeout_ms: u64,
    pub ring_key: String,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            instance_id: "agent-1".to_string(),
            advertise_addr: "127.0.0.1:12346".to_string(),
            num_tokens: 128,
            heartbeat_period_ms: 5_000,
            heartbeat_timeout_ms: 60_000,
            ring_key: "collectors/ring".to_string(),
        }
    }
}

impl LifecyclerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store; only useful for a single node or tests.
    InMemory,
    Etcd,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub etcd_endpoints: Vec<String>,
    /// Key prefix under which configs are stored.
    pub prefix: String,
    pub dial_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            etcd_endpoints: vec!["127.0.0.1:2379".to_string()],
            prefix: "configurations/".to_string(),
            dial_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub grpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub cluster: ClusterConfig,
    pub lifecycler: LifecyclerConfig,
    pub store: StoreConfig,
    pub global: GlobalConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([127, 0, 0, 1], 12346)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 12345)),
            cluster: ClusterConfig::default(),
            lifecycler: LifecyclerConfig::default(),
            store: StoreConfig::default(),
            global: GlobalConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(instance_id: impl Into<String>, grpc_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        let mut cfg = Self {
            grpc_addr,
            http_addr,
            ..Default::default()
        };
        cfg.lifecycler.instance_id = instance_id.into();
        cfg.lifecycler.advertise_addr = grpc_addr.to_string();
        cfg
    }

    pub fn with_clustering(mut self) -> Self {
        self.cluster.enabled = true;
        self
    }

    /// Reject settings the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.reshard_interval_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "reshard interval must be greater than zero".to_string(),
            ));
        }
        if !self.cluster.enabled {
            return Ok(());
        }
        let lifecycler = &self.lifecycler;
        if lifecycler.heartbeat_period_ms == 0 {
            return Err(ClusterError::InvalidConfig(
                "heartbeat period must be greater than zero".to_string(),
            ));
        }
        if lifecycler.heartbeat_timeout_ms <= lifecycler.heartbeat_period_ms {
            return Err(ClusterError::InvalidConfig(format!(
                "heartbeat timeout ({}ms) must be longer than the heartbeat period ({}ms)",
                lifecycler.heartbeat_timeout_ms, lifecycler.heartbeat_period_ms
            )));
        }
        if lifecycler.num_tokens == 0 {
            return Err(ClusterError::InvalidConfig("num_tokens must be greater than zero".to_string()));
        }
        Ok(())
    }
}
