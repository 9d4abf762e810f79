use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::kv::{CasFn, KvClient, KvError, KvEvent};

const MAX_CAS_RETRIES: usize = 10;
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 1024;

/// [`KvClient`] backed by etcd.
///
/// CAS writes are a transaction guarded on the key's mod revision (or its
/// absence), retried when another writer wins the race.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, KvError> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

#[async_trait]
impl KvClient for EtcdKv {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
            .await?;

        let mut keys = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            keys.push(kv.key_str()?.to_string());
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<(), KvError> {
        let mut client = self.client.clone();

        for attempt in 0..MAX_CAS_RETRIES {
            let resp = client.get(key, None).await?;
            let (current, guard) = match resp.kvs().first() {
                Some(kv) => (
                    Some(kv.value_str()?.to_string()),
                    Compare::mod_revision(key, CompareOp::Equal, kv.mod_revision()),
                ),
                None => (None, Compare::create_revision(key, CompareOp::Equal, 0)),
            };

            let Some(next) = f(current.as_deref())? else {
                return Ok(());
            };

            let txn = Txn::new()
                .when(vec![guard])
                .and_then(vec![TxnOp::put(key, next, None)]);
            if client.txn(txn).await?.succeeded() {
                return Ok(());
            }
            tracing::debug!(key = %key, attempt, "CAS lost race, retrying");
        }

        Err(KvError::Conflict(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError> {
        let mut client = self.client.clone();
        let prefix = prefix.to_string();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut current = Some(
            client
                .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                .await?,
        );

        tokio::spawn(async move {
            loop {
                let (mut watcher, mut stream) = match current.take() {
                    Some(pair) => pair,
                    None => match client
                        .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
                        .await
                    {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(prefix = %prefix, error = %e, "Failed to re-establish watch");
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => continue,
                            }
                        }
                    },
                };

                tracing::debug!(prefix = %prefix, "Watching etcd prefix");

                loop {
                    let message = tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = watcher.cancel().await;
                            return;
                        }
                        message = stream.message() => message,
                    };

                    match message {
                        Ok(Some(resp)) => {
                            for event in resp.events() {
                                let Some(kv) = event.kv() else { continue };
                                let key = match kv.key_str() {
                                    Ok(k) => k.to_string(),
                                    Err(e) => {
                                        tracing::warn!(error = %e, "Invalid key encoding");
                                        continue;
                                    }
                                };
                                let value = match event.event_type() {
                                    EventType::Put => match kv.value_str() {
                                        Ok(v) => Some(v.to_string()),
                                        Err(e) => {
                                            tracing::warn!(key = %key, error = %e, "Invalid value encoding");
                                            continue;
                                        }
                                    },
                                    EventType::Delete => None,
                                };
                                if tx.send(KvEvent { key, value }).await.is_err() {
                                    let _ = watcher.cancel().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(prefix = %prefix, "Watch stream ended, reconnecting");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(prefix = %prefix, error = %e, "Watch error, reconnecting");
                            break;
                        }
                    }
                }

                let _ = watcher.cancel().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
                }
            }
        });

        Ok(rx)
    }
}
