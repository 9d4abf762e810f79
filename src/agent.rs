use std::sync::Arc;

use axum::Router;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterNode, GrpcPeerNotifier, KvRing, MembershipView, StandaloneMembership};
use crate::config::{NodeConfig, StoreBackend};
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::http::{self, HttpState};
use crate::instance::{BasicManager, IdleInstanceFactory, InstanceFactory, InstanceManager};
use crate::observability::MetricsRegistry;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::store::api::ConfigApi;
use crate::store::etcd::EtcdKv;
use crate::store::{ConfigStore, KvClient, MemoryKv, RemoteStore, StoreError};
use crate::validate::ConfigValidator;

/// One agent process: store, membership, reconciler and the servers in front
/// of them.
pub struct Agent {
    config: NodeConfig,
    registry: MetricsRegistry,
    store: Arc<dyn ConfigStore>,
    api: ConfigApi,
    manager: Arc<dyn InstanceManager>,
    reconciler: Arc<Reconciler>,
    node: Arc<ClusterNode>,
    ring: Option<Arc<KvRing>>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Build an agent from `config`, connecting to the configured store.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let kv: Arc<dyn KvClient> = match config.store.backend {
            StoreBackend::InMemory => Arc::new(MemoryKv::new()),
            StoreBackend::Etcd => Arc::new(
                EtcdKv::connect(&config.store.etcd_endpoints, config.store.dial_timeout())
                    .await
                    .map_err(StoreError::from)?,
            ),
        };
        Self::with_kv(config, kv, Arc::new(IdleInstanceFactory)).await
    }

    /// Build an agent over an existing KV client. Agents sharing `kv` share
    /// both the config store and the ring.
    pub async fn with_kv(
        config: NodeConfig,
        kv: Arc<dyn KvClient>,
        factory: Arc<dyn InstanceFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = MetricsRegistry::new();
        let background = CancellationToken::new();

        let store: Arc<dyn ConfigStore> =
            Arc::new(RemoteStore::connect(kv.clone(), config.store.prefix.clone(), background.clone()).await?);

        let ring = if config.cluster.enabled {
            Some(KvRing::connect(kv, &config.lifecycler, background.clone()).await?)
        } else {
            tracing::info!("Clustering disabled, running every stored config locally");
            None
        };
        let membership: Arc<dyn MembershipView> = match &ring {
            Some(ring) => ring.clone(),
            None => Arc::new(StandaloneMembership::new(config.lifecycler.advertise_addr.clone())),
        };

        let manager: Arc<dyn InstanceManager> = Arc::new(BasicManager::new(factory));
        let validator = ConfigValidator::new(config.cluster.allow_local_file_reads);
        let api = ConfigApi::new(store.clone(), validator, config.global.clone(), &registry);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            membership.clone(),
            manager.clone(),
            ReconcilerConfig {
                global: config.global.clone(),
                validator,
                reshard_timeout: config.cluster.reshard_timeout(),
            },
            &registry,
        ));

        let notifier = Arc::new(GrpcPeerNotifier::new(config.cluster.notify_timeout()));
        let node = Arc::new(ClusterNode::new(
            membership,
            notifier,
            reconciler.clone(),
            &config.cluster,
            &registry,
        ));

        Ok(Self {
            config,
            registry,
            store,
            api,
            manager,
            reconciler,
            node,
            ring,
            background,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<dyn InstanceManager> {
        &self.manager
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn node(&self) -> &Arc<ClusterNode> {
        &self.node
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// The HTTP routes this agent serves. Every router shares one config
    /// API, so config writes are serialized across all of them.
    pub fn router(&self) -> Router {
        http::router(
            self.api.clone(),
            HttpState {
                node: self.node.clone(),
                registry: self.registry.clone(),
            },
        )
    }

    /// Start the servers and background loops, then join the cluster.
    ///
    /// Returns once the join has completed. The gRPC server is listening
    /// before the join starts so peers can reach this node as soon as it is
    /// in the ring.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = Vec::new();

        let grpc = GrpcServer::new(self.config.grpc_addr, self.reconciler.clone());
        let grpc_shutdown = self.background.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc.run(grpc_shutdown).await {
                tracing::error!(error = %e, "gRPC server failed");
            }
        }));

        tasks.push(tokio::spawn(http::run_http(
            self.config.http_addr,
            self.router(),
            self.background.clone(),
        )));

        if let Some(ring) = &self.ring {
            tasks.push(ring.spawn_heartbeat(self.config.lifecycler.heartbeat_period(), self.background.clone()));
        }
        tasks.push(self.reconciler.spawn_watch_loop(self.background.clone()));

        self.tasks.lock().extend(tasks);

        self.node.join().await?;

        let refresh = self
            .reconciler
            .spawn_refresh_loop(self.config.cluster.reshard_interval(), self.background.clone());
        self.tasks.lock().push(refresh);

        tracing::info!(
            instance_id = %self.config.lifecycler.instance_id,
            grpc_addr = %self.config.grpc_addr,
            http_addr = %self.config.http_addr,
            clustered = self.config.cluster.enabled,
            "Agent started"
        );
        Ok(())
    }

    /// Leave the cluster, stop every background task and every running
    /// config.
    pub async fn shutdown(&self) {
        if self.node.is_ready() {
            if let Err(e) = self.node.leave().await {
                tracing::warn!(error = %e, "Failed to leave cluster cleanly");
            }
        }

        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.reconciler.stop().await;
        self.manager.stop().await;
        tracing::info!(instance_id = %self.config.lifecycler.instance_id, "Agent stopped");
    }

    /// Start, run until `shutdown` fires, then shut down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if let Err(e) = self.start().await {
            self.shutdown().await;
            return Err(e);
        }
        shutdown.cancelled().await;
        tracing::info!("Shutdown requested, leaving cluster");
        self.shutdown().await;
        Ok(())
    }
}
