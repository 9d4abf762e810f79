use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::instance::InstanceConfig;
use crate::store::kv::{KvClient, KvEvent};
use crate::store::{ConfigStore, KeepFn, StoreError, WatchEvent};

const WATCH_BUFFER: usize = 1024;
const ALL_BUFFER: usize = 64;

/// [`ConfigStore`] over a [`KvClient`], storing each config as JSON under
/// `<prefix><name>`.
pub struct RemoteStore {
    kv: Arc<dyn KvClient>,
    prefix: String,
    events: broadcast::Sender<WatchEvent>,
}

impl RemoteStore {
    /// Connect to `kv` and start forwarding changes under `prefix` to
    /// [`ConfigStore::watch`] subscribers until `cancel` fires.
    pub async fn connect(
        kv: Arc<dyn KvClient>,
        prefix: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        let (events, _) = broadcast::channel(WATCH_BUFFER);

        let mut raw = kv.watch_prefix(&prefix, cancel).await?;
        let forward = events.clone();
        let strip = prefix.clone();
        tokio::spawn(async move {
            while let Some(KvEvent { key, value }) = raw.recv().await {
                let Some(name) = key.strip_prefix(&strip) else { continue };
                let config = match value.as_deref().map(serde_json::from_str::<InstanceConfig>) {
                    None => None,
                    Some(Ok(cfg)) => Some(cfg),
                    Some(Err(e)) => {
                        tracing::warn!(key = %name, error = %e, "Skipping undecodable config in watch");
                        continue;
                    }
                };
                let _ = forward.send(WatchEvent {
                    key: name.to_string(),
                    config,
                });
            }
            tracing::debug!("Config watch closed");
        });

        Ok(Self { kv, prefix, events })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl ConfigStore for RemoteStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.kv.list(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<InstanceConfig, StoreError> {
        match self.kv.get(&self.key(key)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(StoreError::NotExist {
                key: key.to_string(),
            }),
        }
    }

    async fn put(&self, cfg: &InstanceConfig) -> Result<bool, StoreError> {
        if cfg.name.is_empty() {
            return Err(StoreError::Validation("config name must not be empty".to_string()));
        }
        let value = serde_json::to_string(cfg)?;

        let mut created = false;
        self.kv
            .cas(&self.key(&cfg.name), &mut |prev| {
                created = prev.is_none();
                Ok(Some(value.clone()))
            })
            .await?;
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        // Read first so a missing key is reported rather than silently accepted.
        let full = self.key(key);
        if self.kv.get(&full).await?.is_none() {
            return Err(StoreError::NotExist {
                key: key.to_string(),
            });
        }
        if !self.kv.delete(&full).await? {
            return Err(StoreError::NotExist {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn all(&self, keep: Option<KeepFn<'_>>) -> Result<mpsc::Receiver<InstanceConfig>, StoreError> {
        let keys: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|k| keep.map_or(true, |keep| keep(k.as_str())))
            .collect();

        let (tx, rx) = mpsc::channel(ALL_BUFFER);
        let kv = self.kv.clone();
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            let mut fetches = JoinSet::new();
            for name in keys {
                let kv = kv.clone();
                let full = format!("{prefix}{name}");
                fetches.spawn(async move { (name, kv.get(&full).await) });
            }

            while let Some(joined) = fetches.join_next().await {
                let (name, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "Config fetch task failed");
                        continue;
                    }
                };
                let cfg = match result {
                    // Deleted between list and get.
                    Ok(None) => continue,
                    Ok(Some(raw)) => match serde_json::from_str::<InstanceConfig>(&raw) {
                        Ok(cfg) => cfg,
                        Err(e) => {
                            tracing::error!(key = %name, error = %e, "Failed to decode config");
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::error!(key = %name, error = %e, "Failed to get config");
                        continue;
                    }
                };
                if tx.send(cfg).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::config::{BasicAuth, RemoteWriteConfig, ScrapeConfig};
    use crate::store::MemoryKv;

    async fn store() -> RemoteStore {
        RemoteStore::connect(Arc::new(MemoryKv::new()), "configurations/", CancellationToken::new())
            .await
            .unwrap()
    }

    fn cfg(name: &str) -> InstanceConfig {
        InstanceConfig::new(name).with_scrape_config(ScrapeConfig::new(format!("{name}-job")))
    }

    #[tokio::test]
    async fn put_reports_created_then_updated() {
        let store = store().await;
        assert!(store.put(&cfg("a")).await.unwrap());
        assert!(!store.put(&cfg("a")).await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn get_round_trips_secrets() {
        let store = store().await;
        let mut rw = RemoteWriteConfig::new("http://cortex/push");
        rw.http_client.basic_auth = Some(BasicAuth {
            username: "u".to_string(),
            password: Some("secret".to_string()),
            password_file: None,
        });
        let original = cfg("a").with_remote_write(rw);

        store.put(&original).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), original);
    }

    #[tokio::test]
    async fn missing_keys_are_not_exist() {
        let store = store().await;
        assert!(store.get("missing").await.unwrap_err().is_not_exist());
        assert!(store.delete("missing").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn all_honours_keep_predicate() {
        let store = store().await;
        for name in ["a", "b", "c"] {
            store.put(&cfg(name)).await.unwrap();
        }

        let keep = |k: &str| k != "b";
        let mut rx = store.all(Some(&keep)).await.unwrap();
        let mut names = Vec::new();
        while let Some(cfg) = rx.recv().await {
            names.push(cfg.name);
        }
        names.sort();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn watch_reports_puts_and_deletes() {
        let store = store().await;
        let mut events = store.watch();

        store.put(&cfg("a")).await.unwrap();
        store.delete("a").await.unwrap();

        let put = events.recv().await.unwrap();
        assert_eq!(put.key, "a");
        assert_eq!(put.config, Some(cfg("a")));

        let delete = events.recv().await.unwrap();
        assert_eq!(delete, WatchEvent { key: "a".to_string(), config: None });
    }
}
