pub mod reshard_service;
pub mod server;

pub use reshard_service::ReshardService;
pub use server::GrpcServer;
