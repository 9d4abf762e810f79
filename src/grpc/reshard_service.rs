use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cluster::ReshardHandler;
use crate::error::ClusterError;
use crate::proto::scraping_service_server::ScrapingService;
use crate::proto::{ReshardRequest, ReshardResponse};

/// Peer-facing service: a `Reshard` call makes this node recompute which
/// configs it owns before answering.
pub struct ReshardService {
    handler: Arc<dyn ReshardHandler>,
}

impl ReshardService {
    pub fn new(handler: Arc<dyn ReshardHandler>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl ScrapingService for ReshardService {
    async fn reshard(&self, request: Request<ReshardRequest>) -> Result<Response<ReshardResponse>, Status> {
        let remote = request.remote_addr();
        tracing::debug!(remote = ?remote, "Reshard requested by peer");

        match self.handler.reshard().await {
            Ok(()) => Ok(Response::new(ReshardResponse {})),
            Err(ClusterError::ReshardTimeout(timeout)) => Err(Status::deadline_exceeded(format!(
                "reshard did not finish within {:?}",
                timeout
            ))),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }
}
