use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::instance::{InstanceConfig, InstanceError};

const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Start/stop/list surface over the running collection pipelines.
///
/// Implementations must tolerate repeated and out-of-order calls for the same
/// name: watch delivery is not FIFO across reconnects, and periodic refreshes
/// re-apply every owned config.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Start `cfg`, or restart it if a config of the same name is running with
    /// different content.
    async fn apply_config(&self, cfg: InstanceConfig) -> Result<(), InstanceError>;

    /// Stop the config named `name`. Fails if it is not running.
    async fn delete_config(&self, name: &str) -> Result<(), InstanceError>;

    async fn list_configs(&self) -> HashMap<String, InstanceConfig>;

    async fn list_instances(&self) -> HashMap<String, InstanceHandle>;

    /// Stop every running config.
    async fn stop(&self);
}

/// Read-only view of a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Number of times this name has been (re)started by the manager.
    pub generation: u64,
}

/// A single running collection pipeline.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Run until `cancel` fires. Returning an error makes the manager restart
    /// the instance after a backoff.
    async fn run(&self, cancel: CancellationToken) -> Result<(), InstanceError>;
}

/// Builds pipelines for configs.
pub trait InstanceFactory: Send + Sync {
    fn new_instance(&self, cfg: &InstanceConfig) -> Result<Arc<dyn Instance>, InstanceError>;
}

/// Factory for agents that only coordinate ownership: each instance logs its
/// jobs and idles until stopped.
#[derive(Debug, Default, Clone)]
pub struct IdleInstanceFactory;

struct IdleInstance {
    name: String,
    jobs: Vec<String>,
}

#[async_trait]
impl Instance for IdleInstance {
    async fn run(&self, cancel: CancellationToken) -> Result<(), InstanceError> {
        tracing::info!(name = %self.name, jobs = ?self.jobs, "Instance started");
        cancel.cancelled().await;
        tracing::info!(name = %self.name, "Instance stopped");
        Ok(())
    }
}

impl InstanceFactory for IdleInstanceFactory {
    fn new_instance(&self, cfg: &InstanceConfig) -> Result<Arc<dyn Instance>, InstanceError> {
        Ok(Arc::new(IdleInstance {
            name: cfg.name.clone(),
            jobs: cfg.job_names().map(str::to_string).collect(),
        }))
    }
}

struct ManagedInstance {
    cfg: InstanceConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
    generation: u64,
}

impl ManagedInstance {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(name = %self.cfg.name, error = %e, "Instance task ended abnormally");
        }
    }
}

/// Runs one tokio task per config and restarts crashed instances.
pub struct BasicManager {
    factory: Arc<dyn InstanceFactory>,
    restart_backoff: Duration,
    instances: Mutex<HashMap<String, ManagedInstance>>,
}

impl BasicManager {
    pub fn new(factory: Arc<dyn InstanceFactory>) -> Self {
        Self {
            factory,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    fn spawn(&self, instance: Arc<dyn Instance>, name: String, cancel: CancellationToken) -> JoinHandle<()> {
        let backoff = self.restart_backoff;
        tokio::spawn(async move {
            loop {
                match instance.run(cancel.clone()).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::error!(name = %name, error = %e, backoff = ?backoff, "Instance stopped abnormally, restarting after backoff");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        })
    }
}

#[async_trait]
impl InstanceManager for BasicManager {
    async fn apply_config(&self, cfg: InstanceConfig) -> Result<(), InstanceError> {
        let mut instances = self.instances.lock().await;

        let mut generation = 1;
        if let Some(existing) = instances.get(&cfg.name) {
            if existing.cfg == cfg {
                return Ok(());
            }
            generation = existing.generation + 1;
        }

        // Build the replacement first so a bad config leaves the old one running.
        let instance = self.factory.new_instance(&cfg)?;

        if let Some(existing) = instances.remove(&cfg.name) {
            tracing::info!(name = %cfg.name, "Restarting instance with updated config");
            existing.shutdown().await;
        }

        let cancel = CancellationToken::new();
        let task = self.spawn(instance, cfg.name.clone(), cancel.clone());
        instances.insert(
            cfg.name.clone(),
            ManagedInstance {
                cfg,
                cancel,
                task,
                started_at: Utc::now(),
                generation,
            },
        );
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<(), InstanceError> {
        let existing = self
            .instances
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))?;
        existing.shutdown().await;
        Ok(())
    }

    async fn list_configs(&self) -> HashMap<String, InstanceConfig> {
        self.instances
            .lock()
            .await
            .iter()
            .map(|(name, inst)| (name.clone(), inst.cfg.clone()))
            .collect()
    }

    async fn list_instances(&self) -> HashMap<String, InstanceHandle> {
        self.instances
            .lock()
            .await
            .iter()
            .map(|(name, inst)| {
                (
                    name.clone(),
                    InstanceHandle {
                        name: name.clone(),
                        started_at: inst.started_at,
                        generation: inst.generation,
                    },
                )
            })
            .collect()
    }

    async fn stop(&self) {
        let drained: Vec<ManagedInstance> = self.instances.lock().await.drain().map(|(_, v)| v).collect();
        for inst in drained {
            inst.shutdown().await;
        }
    }
}
