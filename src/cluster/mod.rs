//! Ring membership, ownership, and the cross-peer reshard protocol.

pub mod backoff;
pub mod client;
pub mod membership;
pub mod node;
pub mod ring;

pub use client::{GrpcPeerNotifier, PeerNotifier};
pub use membership::{KvRing, MembershipView, StandaloneMembership};
pub use node::{ClusterNode, NodeState, ReshardHandler};
pub use ring::{Peer, RingDesc, RingError};
