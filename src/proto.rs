//! Wire types for the cluster gRPC surface.
//!
//! The service stubs are generated by `build.rs`; the messages are plain prost
//! structs so no `.proto` compilation step is required.

/// Asks the receiving agent to recompute ownership of every stored config.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReshardRequest {}

/// Empty acknowledgement returned once the reshard has completed.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReshardResponse {}

include!(concat!(env!("OUT_DIR"), "/cluster.ScrapingService.rs"));
