use thiserror::Error;

use crate::cluster::RingError;
use crate::instance::InstanceError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Node has not joined the cluster")]
    NotJoined,

    #[error("Node already left the cluster")]
    AlreadyLeft,

    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("Reshard timed out after {0:?}")]
    ReshardTimeout(std::time::Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
