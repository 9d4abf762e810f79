//! Converges the configs running on this node with the store and the ring.
//!
//! A single lock guards the tracked set and every call into the instance
//! manager, so watch events, periodic refreshes, and reshard requests are
//! applied strictly one after another.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{Counter, Gauge, Histogram};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{MembershipView, ReshardHandler};
use crate::error::{ClusterError, Result};
use crate::instance::{GlobalConfig, InstanceConfig, InstanceError, InstanceManager};
use crate::observability::MetricsRegistry;
use crate::store::{ConfigStore, WatchEvent};
use crate::validate::ConfigValidator;

struct ReconcilerMetrics {
    reshard_success: Histogram,
    reshard_failure: Histogram,
    tracked: Gauge,
    applied: Counter,
    deleted: Counter,
    ignored: Counter,
}

impl ReconcilerMetrics {
    fn new(registry: &MetricsRegistry) -> Self {
        let duration = |success: &str| {
            registry.histogram(
                "agent_scraping_service_reshard_duration_seconds",
                "How long it took for resharding to run",
                &[("success", success.to_string())],
            )
        };
        let events = |action: &str| {
            registry.counter(
                "agent_scraping_service_config_events_total",
                "Per-config reconciliation decisions",
                &[("action", action.to_string())],
            )
        };
        Self {
            reshard_success: duration("1"),
            reshard_failure: duration("0"),
            tracked: registry.gauge(
                "agent_scraping_service_tracked_configs",
                "Configs currently running on this node",
                &[],
            ),
            applied: events("apply"),
            deleted: events("delete"),
            ignored: events("ignore"),
        }
    }
}

/// Settings shared by every reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    pub global: GlobalConfig,
    pub validator: ConfigValidator,
    /// Bound on waiting for the lock and reading the store during a refresh.
    pub reshard_timeout: Option<Duration>,
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    membership: Arc<dyn MembershipView>,
    manager: Arc<dyn InstanceManager>,
    config: ReconcilerConfig,
    tracked: Mutex<HashSet<String>>,
    events: parking_lot::Mutex<Option<broadcast::Receiver<WatchEvent>>>,
    metrics: ReconcilerMetrics,
}

impl Reconciler {
    /// Subscribes to store changes immediately so events published before the
    /// watch loop starts are not lost.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        membership: Arc<dyn MembershipView>,
        manager: Arc<dyn InstanceManager>,
        config: ReconcilerConfig,
        registry: &MetricsRegistry,
    ) -> Self {
        let events = store.watch();
        Self {
            store,
            membership,
            manager,
            config,
            tracked: Mutex::new(HashSet::new()),
            events: parking_lot::Mutex::new(Some(events)),
            metrics: ReconcilerMetrics::new(registry),
        }
    }

    /// Names of the configs this node believes it is running.
    pub async fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracked.lock().await.iter().cloned().collect();
        names.sort();
        names
    }

    /// Whether this node owns `key`. A failed lookup counts as not owned:
    /// dropping a config is preferred over two nodes running it.
    fn owns(&self, key: &str) -> bool {
        match self.membership.owner(key) {
            Ok(peer) => self.membership.is_self(&peer),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to look up owner, treating as not owned");
                false
            }
        }
    }

    /// Validate a config read from the store and fill in this node's defaults.
    fn prepare(&self, mut cfg: InstanceConfig) -> std::result::Result<InstanceConfig, String> {
        self.config.validator.validate(&cfg).map_err(|e| e.to_string())?;
        cfg.apply_defaults(&self.config.global).map_err(|e| e.to_string())?;
        Ok(cfg)
    }

    /// Apply a single store change.
    pub async fn handle_event(&self, event: WatchEvent) {
        let mut tracked = self.tracked.lock().await;
        self.handle_locked(&mut tracked, event).await;
        self.metrics.tracked.set(tracked.len() as f64);
    }

    /// Returns whether `event.key` is tracked afterwards.
    async fn handle_locked(&self, tracked: &mut HashSet<String>, event: WatchEvent) -> bool {
        let WatchEvent { key, config } = event;
        let was_tracked = tracked.contains(&key);

        let cfg = match config {
            Some(cfg) if self.owns(&key) => cfg,
            _ => {
                if was_tracked {
                    self.stop_tracking(tracked, &key).await;
                } else {
                    self.metrics.ignored.increment(1);
                    tracing::debug!(key = %key, "Ignoring config not owned by this node");
                }
                return tracked.contains(&key);
            }
        };

        let cfg = match self.prepare(cfg) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Config failed validation, not applying");
                if was_tracked {
                    self.stop_tracking(tracked, &key).await;
                } else {
                    self.metrics.ignored.increment(1);
                }
                return tracked.contains(&key);
            }
        };

        match self.manager.apply_config(cfg).await {
            Ok(()) => {
                if was_tracked {
                    tracing::debug!(key = %key, "Re-applied config");
                } else {
                    tracing::info!(key = %key, "Started config");
                }
                self.metrics.applied.increment(1);
                tracked.insert(key);
                true
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to apply config");
                // Stop whatever may still be running under this name so the key
                // can drop out of the tracked set and be retried from scratch.
                if was_tracked {
                    self.stop_tracking(tracked, &key).await;
                }
                tracked.contains(&key)
            }
        }
    }

    /// Delete `key` from the instance manager. The key stays tracked if the
    /// delete fails so it is retried next cycle.
    async fn stop_tracking(&self, tracked: &mut HashSet<String>, key: &str) {
        match self.manager.delete_config(key).await {
            Ok(()) | Err(InstanceError::NotFound(_)) => {
                tracing::info!(key = %key, "Stopped config");
                self.metrics.deleted.increment(1);
                tracked.remove(key);
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to stop config, will retry");
            }
        }
    }

    /// Reconcile every key in the store against the ring.
    ///
    /// Owned configs are applied, tracked configs that are gone or no longer
    /// owned are stopped. If the deadline passes while waiting for the lock or
    /// reading the store, nothing is changed and an error is returned.
    pub async fn refresh(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.refresh_inner().await;

        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(()) => self.metrics.reshard_success.record(elapsed),
            Err(e) => {
                self.metrics.reshard_failure.record(elapsed);
                tracing::warn!(error = %e, "Refresh failed");
            }
        }
        result
    }

    async fn refresh_inner(&self) -> Result<()> {
        let deadline = self
            .config
            .reshard_timeout
            .map(|timeout| (timeout, TokioInstant::now() + timeout));

        let mut tracked = match deadline {
            Some((timeout, at)) => tokio::time::timeout_at(at, self.tracked.lock())
                .await
                .map_err(|_| ClusterError::ReshardTimeout(timeout))?,
            None => self.tracked.lock().await,
        };

        let configs = match deadline {
            Some((timeout, at)) => tokio::time::timeout_at(at, self.collect_owned())
                .await
                .map_err(|_| ClusterError::ReshardTimeout(timeout))??,
            None => self.collect_owned().await?,
        };

        let mut discovered = HashSet::new();
        for cfg in configs {
            let key = cfg.name.clone();
            let event = WatchEvent {
                key: key.clone(),
                config: Some(cfg),
            };
            if self.handle_locked(&mut tracked, event).await {
                discovered.insert(key);
            }
        }

        let stale: Vec<String> = tracked.difference(&discovered).cloned().collect();
        for key in stale {
            self.stop_tracking(&mut tracked, &key).await;
        }
        // What remains is `discovered` plus stale keys whose delete failed.

        self.metrics.tracked.set(tracked.len() as f64);
        tracing::debug!(tracked = tracked.len(), "Refresh complete");
        Ok(())
    }

    /// Read every owned config from the store.
    async fn collect_owned(&self) -> Result<Vec<InstanceConfig>> {
        if let Err(e) = self.membership.sync().await {
            tracing::warn!(error = %e, "Failed to refresh ring view, using cached ring");
        }

        let keep = |key: &str| self.owns(key);
        let mut rx = self.store.all(Some(&keep)).await?;
        let mut configs = Vec::new();
        while let Some(cfg) = rx.recv().await {
            configs.push(cfg);
        }
        Ok(configs)
    }

    /// Stop every tracked config. Used on shutdown.
    pub async fn stop(&self) {
        let mut tracked = self.tracked.lock().await;
        let keys: Vec<String> = tracked.iter().cloned().collect();
        for key in keys {
            self.stop_tracking(&mut tracked, &key).await;
        }
        self.metrics.tracked.set(tracked.len() as f64);
        tracing::info!(remaining = tracked.len(), "Stopped tracked configs");
    }

    /// Consume store changes until `cancel` fires. A lagged subscription
    /// falls back to a full refresh.
    pub fn spawn_watch_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.clone();
        let events = reconciler.events.lock().take();
        let mut events = events.unwrap_or_else(|| reconciler.store.watch());

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => reconciler.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "Config watch lagged, refreshing");
                        let _ = reconciler.refresh().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Config watch closed");
                        return;
                    }
                }
            }
        })
    }

    /// Refresh every `interval` until `cancel` fires.
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let _ = reconciler.refresh().await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ReshardHandler for Reconciler {
    async fn reshard(&self) -> Result<()> {
        self.refresh().await
    }
}
