pub mod api;
pub mod etcd;
pub mod kv;
pub mod remote;

pub use kv::{KvClient, KvError, KvEvent, MemoryKv};
pub use remote::RemoteStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::instance::InstanceConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key {key:?} does not exist")]
    NotExist { key: String },

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("failed to decode config: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, StoreError::NotExist { .. })
    }
}

/// A change to one key. `config` is `None` when the key was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: String,
    pub config: Option<InstanceConfig>,
}

/// Predicate deciding whether [`ConfigStore::all`] fetches a key.
pub type KeepFn<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Shared store of configs, keyed by config name.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<InstanceConfig, StoreError>;

    /// Compare-and-swap write. Returns `true` when no previous value existed.
    async fn put(&self, cfg: &InstanceConfig) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Fetch every key accepted by `keep`. The channel closes once every key
    /// has been read; keys that fail to read are logged and skipped.
    async fn all(&self, keep: Option<KeepFn<'_>>) -> Result<mpsc::Receiver<InstanceConfig>, StoreError>;

    /// Subscribe to changes of every key under management.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
