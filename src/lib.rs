pub mod agent;
pub mod cluster;
pub mod config;
pub mod error;
pub mod grpc;
pub mod http;
pub mod instance;
pub mod observability;
pub mod proto;
pub mod reconciler;
pub mod shutdown;
pub mod store;
pub mod validate;
