use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::ring::{InstanceDesc, InstanceState, Peer, RingDesc, RingError};
use crate::config::LifecyclerConfig;
use crate::store::{KvClient, KvError};

/// Which peers are in the fleet and which of them owns a key.
///
/// `owner` and `all_healthy` answer from the currently observed membership
/// and never block on the network; `sync` brings that view up to date.
#[async_trait]
pub trait MembershipView: Send + Sync {
    fn owner(&self, key: &str) -> Result<Peer, RingError>;

    fn all_healthy(&self) -> Result<Vec<Peer>, RingError>;

    /// Address other peers use to reach this node.
    fn self_addr(&self) -> &str;

    fn is_self(&self, peer: &Peer) -> bool {
        peer.addr == self.self_addr()
    }

    async fn register_self(&self) -> Result<(), RingError>;

    async fn deregister_self(&self) -> Result<(), RingError>;

    /// Refresh the observed membership from the substrate.
    async fn sync(&self) -> Result<(), RingError> {
        Ok(())
    }
}

/// Membership of a node running without clustering: it is the only peer and
/// owns every key.
pub struct StandaloneMembership {
    addr: String,
}

impl StandaloneMembership {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    fn peer(&self) -> Peer {
        Peer {
            addr: self.addr.clone(),
            tokens: Vec::new(),
            healthy: true,
        }
    }
}

#[async_trait]
impl MembershipView for StandaloneMembership {
    fn owner(&self, _key: &str) -> Result<Peer, RingError> {
        Ok(self.peer())
    }

    fn all_healthy(&self) -> Result<Vec<Peer>, RingError> {
        Ok(vec![self.peer()])
    }

    fn self_addr(&self) -> &str {
        &self.addr
    }

    async fn register_self(&self) -> Result<(), RingError> {
        Ok(())
    }

    async fn deregister_self(&self) -> Result<(), RingError> {
        Ok(())
    }
}

/// A [`MembershipView`] whose ring lives under one key of a [`KvClient`].
///
/// The ring is cached locally and kept current by a watch on the ring key;
/// registration and heartbeats go through CAS so concurrent writers never
/// clobber each other's entries.
pub struct KvRing {
    kv: Arc<dyn KvClient>,
    ring_key: String,
    instance_id: String,
    addr: String,
    num_tokens: usize,
    heartbeat_timeout: Duration,
    cached: Arc<RwLock<RingDesc>>,
    registered: AtomicBool,
}

impl KvRing {
    /// Load the ring and start following changes to it until `cancel` fires.
    pub async fn connect(
        kv: Arc<dyn KvClient>,
        config: &LifecyclerConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RingError> {
        let ring = Arc::new(Self {
            kv,
            ring_key: config.ring_key.clone(),
            instance_id: config.instance_id.clone(),
            addr: config.advertise_addr.clone(),
            num_tokens: config.num_tokens,
            heartbeat_timeout: config.heartbeat_timeout(),
            cached: Arc::new(RwLock::new(RingDesc::default())),
            registered: AtomicBool::new(false),
        });

        let mut events = ring.kv.watch_prefix(&ring.ring_key, cancel).await?;
        ring.sync().await?;

        let cached = ring.cached.clone();
        let ring_key = ring.ring_key.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.key != ring_key {
                    continue;
                }
                let desc = match event.value.as_deref().map(RingDesc::decode) {
                    Some(Ok(desc)) => desc,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Ignoring undecodable ring update");
                        continue;
                    }
                    None => RingDesc::default(),
                };
                *cached.write() = desc;
            }
        });

        Ok(ring)
    }

    /// Snapshot of the locally cached ring.
    pub fn describe(&self) -> RingDesc {
        self.cached.read().clone()
    }

    /// Heartbeat this node's ring entry every `period` until `cancel` fires.
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let ring = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !ring.registered.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = ring.heartbeat().await {
                    tracing::warn!(instance_id = %ring.instance_id, error = %e, "Failed to heartbeat ring entry");
                }
            }
        })
    }

    async fn heartbeat(&self) -> Result<(), RingError> {
        let id = self.instance_id.clone();
        self.update(move |desc| match desc.instances.get_mut(&id) {
            Some(entry) => {
                entry.heartbeat_ms = Utc::now().timestamp_millis();
                true
            }
            None => false,
        })
        .await
    }

    /// CAS the ring through `f`, which returns whether it changed anything.
    async fn update<F>(&self, mut f: F) -> Result<(), RingError>
    where
        F: FnMut(&mut RingDesc) -> bool + Send,
    {
        let mut written = None;
        self.kv
            .cas(&self.ring_key, &mut |current| {
                let mut desc = match current {
                    Some(raw) => RingDesc::decode(raw).map_err(|e| KvError::Other(e.to_string()))?,
                    None => RingDesc::default(),
                };
                if !f(&mut desc) {
                    return Ok(None);
                }
                let raw = desc.encode().map_err(|e| KvError::Other(e.to_string()))?;
                written = Some(desc);
                Ok(Some(raw))
            })
            .await?;

        if let Some(desc) = written {
            *self.cached.write() = desc;
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipView for KvRing {
    fn owner(&self, key: &str) -> Result<Peer, RingError> {
        self.cached
            .read()
            .owner(key, Utc::now().timestamp_millis(), self.heartbeat_timeout)
    }

    fn all_healthy(&self) -> Result<Vec<Peer>, RingError> {
        let peers = self
            .cached
            .read()
            .healthy_peers(Utc::now().timestamp_millis(), self.heartbeat_timeout);
        if peers.is_empty() {
            return Err(RingError::Empty);
        }
        Ok(peers)
    }

    fn self_addr(&self) -> &str {
        &self.addr
    }

    async fn register_self(&self) -> Result<(), RingError> {
        let id = self.instance_id.clone();
        let addr = self.addr.clone();
        let num_tokens = self.num_tokens;
        self.update(move |desc| {
            // A restarted instance keeps the tokens it registered before.
            let tokens = match desc.instances.get(&id) {
                Some(existing) if existing.tokens.len() == num_tokens => existing.tokens.clone(),
                _ => desc.claim_tokens(num_tokens),
            };
            desc.instances.insert(
                id.clone(),
                InstanceDesc {
                    addr: addr.clone(),
                    tokens,
                    state: InstanceState::Active,
                    heartbeat_ms: Utc::now().timestamp_millis(),
                },
            );
            true
        })
        .await?;

        self.registered.store(true, Ordering::SeqCst);
        tracing::info!(instance_id = %self.instance_id, addr = %self.addr, tokens = self.num_tokens, "Registered in ring");
        Ok(())
    }

    async fn deregister_self(&self) -> Result<(), RingError> {
        self.registered.store(false, Ordering::SeqCst);
        let id = self.instance_id.clone();
        // Marked first so the entry stops owning keys even if the removal fails.
        self.update(|desc| match desc.instances.get_mut(&id) {
            Some(entry) if entry.state != InstanceState::Leaving => {
                entry.state = InstanceState::Leaving;
                true
            }
            _ => false,
        })
        .await?;
        self.update(move |desc| desc.instances.remove(&id).is_some())
            .await?;
        tracing::info!(instance_id = %self.instance_id, "Removed from ring");
        Ok(())
    }

    async fn sync(&self) -> Result<(), RingError> {
        let desc = match self.kv.get(&self.ring_key).await? {
            Some(raw) => RingDesc::decode(&raw)?,
            None => RingDesc::default(),
        };
        *self.cached.write() = desc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn lifecycler(id: &str) -> LifecyclerConfig {
        LifecyclerConfig {
            instance_id: id.to_string(),
            advertise_addr: format!("{id}:9095"),
            num_tokens: 16,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_and_deregister_update_every_view() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let cancel = CancellationToken::new();
        let a = KvRing::connect(kv.clone(), &lifecycler("a"), cancel.clone()).await.unwrap();
        let b = KvRing::connect(kv.clone(), &lifecycler("b"), cancel.clone()).await.unwrap();

        assert_eq!(a.all_healthy(), Err(RingError::Empty));

        a.register_self().await.unwrap();
        b.register_self().await.unwrap();
        a.sync().await.unwrap();

        let mut addrs: Vec<String> = a.all_healthy().unwrap().into_iter().map(|p| p.addr).collect();
        addrs.sort();
        assert_eq!(addrs, vec!["a:9095", "b:9095"]);
        for key in ["job1", "job2", "job3"] {
            assert_eq!(a.owner(key).unwrap(), b.owner(key).unwrap());
        }

        b.deregister_self().await.unwrap();
        a.sync().await.unwrap();
        assert_eq!(a.all_healthy().unwrap().len(), 1);
        assert!(a.is_self(&a.owner("job1").unwrap()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn deregister_marks_entry_leaving_before_removing_it() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let cancel = CancellationToken::new();
        let ring = KvRing::connect(kv.clone(), &lifecycler("a"), cancel.clone()).await.unwrap();
        ring.register_self().await.unwrap();

        let mut events = kv.watch_prefix("collectors/ring", cancel.clone()).await.unwrap();
        ring.deregister_self().await.unwrap();

        let leaving = RingDesc::decode(&events.recv().await.unwrap().value.unwrap()).unwrap();
        assert_eq!(leaving.instances["a"].state, InstanceState::Leaving);
        assert_eq!(leaving.healthy_peers(Utc::now().timestamp_millis(), Duration::from_secs(60)), vec![]);

        let removed = RingDesc::decode(&events.recv().await.unwrap().value.unwrap()).unwrap();
        assert!(removed.instances.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn standalone_owns_everything() {
        let standalone = StandaloneMembership::new("solo:1");
        assert!(standalone.is_self(&standalone.owner("anything").unwrap()));
        assert_eq!(standalone.all_healthy().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reregistering_keeps_tokens() {
        let kv: Arc<dyn KvClient> = Arc::new(MemoryKv::new());
        let ring = KvRing::connect(kv, &lifecycler("a"), CancellationToken::new())
            .await
            .unwrap();
        ring.register_self().await.unwrap();
        let first = ring.describe().instances["a"].tokens.clone();
        ring.register_self().await.unwrap();
        assert_eq!(ring.describe().instances["a"].tokens, first);
        assert_eq!(first.len(), 16);
    }
}
