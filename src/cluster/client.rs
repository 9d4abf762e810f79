use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::proto::scraping_service_client::ScrapingServiceClient;
use crate::proto::ReshardRequest;

/// Tells a peer to recompute which configs it owns.
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    async fn notify_reshard(&self, addr: &str) -> Result<(), Status>;
}

/// [`PeerNotifier`] calling the `Reshard` RPC over gRPC.
///
/// Channels are cached per address and dropped after a failed call so the
/// next attempt reconnects.
pub struct GrpcPeerNotifier {
    timeout: Duration,
    pool: Arc<Mutex<HashMap<String, ScrapingServiceClient<Channel>>>>,
}

impl GrpcPeerNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn get_client(&self, addr: &str) -> Result<ScrapingServiceClient<Channel>, Status> {
        let cached = self.pool.lock().await.get(addr).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        // The pool is not held across connect.
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| Status::internal(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Status::unavailable(format!("Failed to connect to {}: {}", addr, e)))?;

        let client = self
            .pool
            .lock()
            .await
            .entry(addr.to_string())
            .or_insert_with(|| ScrapingServiceClient::new(channel))
            .clone();
        Ok(client)
    }
}

#[async_trait]
impl PeerNotifier for GrpcPeerNotifier {
    async fn notify_reshard(&self, addr: &str) -> Result<(), Status> {
        let mut client = self.get_client(addr).await?;
        match client.reshard(ReshardRequest {}).await {
            Ok(_) => Ok(()),
            Err(status) => {
                self.pool.lock().await.remove(addr);
                Err(status)
            }
        }
    }
}
