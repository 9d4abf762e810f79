//! Token ring shared by every agent.
//!
//! Each agent registers a set of random 32-bit tokens. A key is owned by the
//! agent holding the first healthy token at or after the key's hash, wrapping
//! around at the top of the ring. Replication factor is fixed at one.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::KvError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("ring has no healthy instances")]
    Empty,

    #[error("instance {0:?} is not registered in the ring")]
    NotRegistered(String),

    #[error("ring kv error: {0}")]
    Kv(#[from] KvError),

    #[error("failed to decode ring: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Active,
    Leaving,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub addr: String,
    pub tokens: Vec<u32>,
    pub state: InstanceState,
    /// Unix milliseconds of the last heartbeat.
    pub heartbeat_ms: i64,
}

impl InstanceDesc {
    pub fn is_healthy(&self, now_ms: i64, timeout: Duration) -> bool {
        self.state == InstanceState::Active && now_ms - self.heartbeat_ms <= timeout.as_millis() as i64
    }
}

/// A member of the ring as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub addr: String,
    pub tokens: Vec<u32>,
    pub healthy: bool,
}

/// The serialized ring, stored under a single KV key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDesc {
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    pub fn decode(raw: &str) -> Result<Self, RingError> {
        serde_json::from_str(raw).map_err(|e| RingError::Codec(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, RingError> {
        serde_json::to_string(self).map_err(|e| RingError::Codec(e.to_string()))
    }

    fn taken_tokens(&self) -> HashSet<u32> {
        self.instances
            .values()
            .flat_map(|i| i.tokens.iter().copied())
            .collect()
    }

    /// Tokens for a new instance that collide with no existing token.
    pub fn claim_tokens(&self, n: usize) -> Vec<u32> {
        generate_tokens(n, &self.taken_tokens())
    }

    pub fn healthy_peers(&self, now_ms: i64, timeout: Duration) -> Vec<Peer> {
        self.instances
            .values()
            .filter(|desc| desc.is_healthy(now_ms, timeout))
            .map(|desc| Peer {
                addr: desc.addr.clone(),
                tokens: desc.tokens.clone(),
                healthy: true,
            })
            .collect()
    }

    /// The healthy instance owning `key`.
    pub fn owner(&self, key: &str, now_ms: i64, timeout: Duration) -> Result<Peer, RingError> {
        // (token, instance id) sorted; ties on token are broken by id so every
        // agent resolves them the same way.
        let mut ring: Vec<(u32, &str)> = self
            .instances
            .iter()
            .filter(|(_, desc)| desc.is_healthy(now_ms, timeout))
            .flat_map(|(id, desc)| desc.tokens.iter().map(move |t| (*t, id.as_str())))
            .collect();
        if ring.is_empty() {
            return Err(RingError::Empty);
        }
        ring.sort_unstable();

        let hash = key_hash(key);
        let idx = ring.partition_point(|(token, _)| *token < hash);
        let (_, id) = ring[idx % ring.len()];

        let desc = self
            .instances
            .get(id)
            .ok_or_else(|| RingError::NotRegistered(id.to_string()))?;
        Ok(Peer {
            addr: desc.addr.clone(),
            tokens: desc.tokens.clone(),
            healthy: true,
        })
    }
}

/// 32-bit FNV-1a. Stable across processes and builds, unlike the std hasher.
pub fn key_hash(key: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    key.bytes()
        .fold(OFFSET, |hash, b| (hash ^ u32::from(b)).wrapping_mul(PRIME))
}

/// `n` random tokens, sorted, none of them in `taken`.
pub fn generate_tokens(n: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut tokens = HashSet::with_capacity(n);
    while tokens.len() < n {
        let candidate: u32 = rng.gen();
        if !taken.contains(&candidate) {
            tokens.insert(candidate);
        }
    }
    let mut tokens: Vec<u32> = tokens.into_iter().collect();
    tokens.sort_unstable();
    tokens
}
