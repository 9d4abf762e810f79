use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("etcd error: {0}")]
    Etcd(String),

    #[error("compare-and-swap on {0:?} did not converge")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl From<etcd_client::Error> for KvError {
    fn from(e: etcd_client::Error) -> Self {
        KvError::Etcd(e.to_string())
    }
}

/// A change to a single key. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub key: String,
    pub value: Option<String>,
}

/// Update function for [`KvClient::cas`]. Receives the current value and
/// returns the value to write, or `None` to leave the key untouched.
pub type CasFn<'a> = &'a mut (dyn FnMut(Option<&str>) -> Result<Option<String>, KvError> + Send);

/// The narrow surface the config store and ring need from a replicated KV
/// substrate.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Keys under `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Read-modify-write `key`, retrying `f` if another writer got in between.
    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<(), KvError>;

    /// Returns `false` when the key did not exist.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Start watching every key under `prefix`. The watch is established
    /// before this returns and runs until `cancel` fires.
    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError>;
}

/// In-process KV, shared by every node of a single-process cluster.
pub struct MemoryKv {
    data: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            data: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    fn publish(&self, key: &str, value: Option<String>) {
        // No receivers is fine.
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<(), KvError> {
        let written = {
            let mut data = self.data.lock();
            let current = data.get(key).map(String::as_str);
            match f(current)? {
                Some(next) => {
                    if current == Some(next.as_str()) {
                        None
                    } else {
                        data.insert(key.to_string(), next.clone());
                        Some(next)
                    }
                }
                None => None,
            }
        };
        if let Some(value) = written {
            self.publish(key, Some(value));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let existed = self.data.lock().remove(key).is_some();
        if existed {
            self.publish(key, None);
        }
        Ok(existed)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError> {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.key.starts_with(&prefix) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(prefix = %prefix, dropped = n, "Watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let kv = MemoryKv::new();
        for key in ["configs/b", "configs/a", "ring", "configsx"] {
            kv.cas(key, &mut |_| Ok(Some("v".to_string()))).await.unwrap();
        }
        assert_eq!(kv.list("configs/").await.unwrap(), vec!["configs/a", "configs/b"]);
    }

    #[tokio::test]
    async fn cas_sees_previous_value() {
        let kv = MemoryKv::new();
        let mut seen = Vec::new();
        for v in ["1", "2"] {
            kv.cas("k", &mut |prev| {
                seen.push(prev.map(str::to_string));
                Ok(Some(v.to_string()))
            })
            .await
            .unwrap();
        }
        assert_eq!(seen, vec![None, Some("1".to_string())]);
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn watch_delivers_puts_and_deletes_under_prefix() {
        let kv = MemoryKv::new();
        let cancel = CancellationToken::new();
        let mut rx = kv.watch_prefix("configs/", cancel.clone()).await.unwrap();

        kv.cas("other", &mut |_| Ok(Some("x".to_string()))).await.unwrap();
        kv.cas("configs/a", &mut |_| Ok(Some("x".to_string()))).await.unwrap();
        assert!(kv.delete("configs/a").await.unwrap());
        assert!(!kv.delete("configs/a").await.unwrap());

        assert_eq!(
            rx.recv().await.unwrap(),
            KvEvent {
                key: "configs/a".to_string(),
                value: Some("x".to_string())
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            KvEvent {
                key: "configs/a".to_string(),
                value: None
            }
        );
        cancel.cancel();
    }
}
