//! Collection configs and the manager that runs them.
//!
//! The collection engine itself (discovery, scraping, WAL, upload) is an
//! external collaborator. This module owns the config model and the narrow
//! start/stop/list surface the reconciler drives.

pub mod config;
pub mod manager;

pub use config::{GlobalConfig, InstanceConfig, ScrapeConfig};
pub use manager::{BasicManager, IdleInstanceFactory, Instance, InstanceFactory, InstanceHandle, InstanceManager};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("config {0:?} does not exist")]
    NotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("instance failed: {0}")]
    Failed(String),
}
