//! Reshard RPC: the service in isolation and over a loopback server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request};

use configshard::cluster::{GrpcPeerNotifier, PeerNotifier, ReshardHandler};
use configshard::error::{ClusterError, Result};
use configshard::grpc::{GrpcServer, ReshardService};
use configshard::proto::scraping_service_server::ScrapingService;
use configshard::proto::ReshardRequest;

#[derive(Default)]
struct ScriptedHandler {
    calls: AtomicUsize,
    outcome: Option<fn() -> ClusterError>,
}

#[async_trait]
impl ReshardHandler for ScriptedHandler {
    async fn reshard(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Some(err) => Err(err()),
            None => Ok(()),
        }
    }
}

fn reshard_timeout() -> ClusterError {
    ClusterError::ReshardTimeout(Duration::from_secs(30))
}

fn store_unavailable() -> ClusterError {
    ClusterError::Internal("store unavailable".to_string())
}

#[tokio::test]
async fn successful_reshard_returns_empty_response() {
    let handler = Arc::new(ScriptedHandler::default());
    let service = ReshardService::new(handler.clone());

    service.reshard(Request::new(ReshardRequest {})).await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_out_reshard_maps_to_deadline_exceeded() {
    let handler = Arc::new(ScriptedHandler {
        outcome: Some(reshard_timeout),
        ..Default::default()
    });
    let service = ReshardService::new(handler);

    let status = service.reshard(Request::new(ReshardRequest {})).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn failed_reshard_maps_to_internal() {
    let handler = Arc::new(ScriptedHandler {
        outcome: Some(store_unavailable),
        ..Default::default()
    });
    let service = ReshardService::new(handler);

    let status = service.reshard(Request::new(ReshardRequest {})).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("store unavailable"));
}

#[tokio::test]
async fn notifier_reaches_server_over_grpc() {
    let addr: SocketAddr = "127.0.0.1:23700".parse().unwrap();
    let handler = Arc::new(ScriptedHandler::default());
    let shutdown = CancellationToken::new();

    let server = GrpcServer::new(addr, handler.clone());
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server.run(server_shutdown).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let notifier = GrpcPeerNotifier::new(Duration::from_secs(1));
    notifier.notify_reshard("127.0.0.1:23700").await.unwrap();
    notifier.notify_reshard("127.0.0.1:23700").await.unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn notifier_reports_unreachable_peer() {
    let notifier = GrpcPeerNotifier::new(Duration::from_millis(200));
    let status = notifier.notify_reshard("127.0.0.1:23799").await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn slow_peer_does_not_delay_notifying_others() {
    let addr: SocketAddr = "127.0.0.1:23710".parse().unwrap();
    let handler = Arc::new(ScriptedHandler::default());
    let shutdown = CancellationToken::new();

    let server = GrpcServer::new(addr, handler.clone());
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server.run(server_shutdown).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let notifier = Arc::new(GrpcPeerNotifier::new(Duration::from_secs(2)));

    // Non-routable: the connect either hangs until the timeout or fails fast.
    let slow = {
        let notifier = notifier.clone();
        tokio::spawn(async move { notifier.notify_reshard("10.255.255.1:9095").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    notifier.notify_reshard("127.0.0.1:23710").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    assert!(slow.await.unwrap().is_err());
    shutdown.cancel();
    server_task.await.unwrap().unwrap();
}
