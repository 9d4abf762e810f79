use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::cluster::ReshardHandler;
use crate::grpc::reshard_service::ReshardService;
use crate::proto::scraping_service_server::ScrapingServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    handler: Arc<dyn ReshardHandler>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, handler: Arc<dyn ReshardHandler>) -> Self {
        Self { addr, handler }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let reshard_service = ReshardService::new(self.handler);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(ScrapingServiceServer::new(reshard_service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }
}
