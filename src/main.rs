use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tonic::transport::Endpoint;

use configshard::agent::Agent;
use configshard::config::{BackoffConfig, ClusterConfig, LifecyclerConfig, NodeConfig, StoreBackend, StoreConfig};
use configshard::instance::GlobalConfig;
use configshard::observability::init_logging;
use configshard::proto::scraping_service_client::ScrapingServiceClient;
use configshard::proto::ReshardRequest;
use configshard::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "configshard")]
#[command(version)]
#[command(about = "Shards a shared pool of collection configs across a fleet of agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start an agent
    Server(Box<ServerArgs>),

    /// Ask an agent to recompute which configs it owns
    Reshard {
        /// gRPC address of the agent
        #[arg(long, short = 'a', default_value = "127.0.0.1:12346")]
        addr: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Inmemory,
    Etcd,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Unique identifier of this agent in the ring
    #[arg(long, default_value = "agent-1")]
    instance_id: String,

    /// Address to serve the Reshard RPC on
    #[arg(long, default_value = "127.0.0.1:12346")]
    grpc_addr: SocketAddr,

    /// Address to serve the config API, metrics and readiness on
    #[arg(long, default_value = "127.0.0.1:12345")]
    http_addr: SocketAddr,

    /// Address peers dial for the Reshard RPC (defaults to --grpc-addr)
    #[arg(long)]
    advertise_addr: Option<String>,

    // === Cluster Options ===
    /// Shard configs across every agent registered in the ring
    #[arg(long)]
    cluster: bool,

    /// Interval between full refreshes, in seconds
    #[arg(long, default_value = "60")]
    reshard_interval_secs: u64,

    /// Upper bound on a single refresh, in seconds (0 disables)
    #[arg(long, default_value = "30")]
    reshard_timeout_secs: u64,

    /// Timeout of one Reshard RPC to a peer, in seconds
    #[arg(long, default_value = "5")]
    notify_timeout_secs: u64,

    /// Upper bound on notifying every peer on join or leave, in seconds
    #[arg(long, default_value = "60")]
    cluster_notify_timeout_secs: u64,

    /// Accept configs that read files from the agent's filesystem
    #[arg(long)]
    allow_local_file_reads: bool,

    /// Initial delay between peer notification attempts, in milliseconds
    #[arg(long, default_value = "1000")]
    min_backoff_ms: u64,

    /// Maximum delay between peer notification attempts, in milliseconds
    #[arg(long, default_value = "120000")]
    max_backoff_ms: u64,

    /// Attempts per peer notification, including the first
    #[arg(long, default_value = "10")]
    max_retries: usize,

    // === Ring Options ===
    /// Tokens this agent claims in the ring
    #[arg(long, default_value = "128")]
    num_tokens: usize,

    /// Interval between ring heartbeats, in seconds
    #[arg(long, default_value = "5")]
    heartbeat_period_secs: u64,

    /// Ring entries without a heartbeat for this long are unhealthy, in seconds
    #[arg(long, default_value = "60")]
    heartbeat_timeout_secs: u64,

    /// KV key holding the ring
    #[arg(long, default_value = "collectors/ring")]
    ring_key: String,

    // === Store Options ===
    /// Config store backend
    #[arg(long, value_enum, default_value = "inmemory")]
    store: Backend,

    /// etcd endpoints (comma-separated)
    #[arg(long, default_value = "127.0.0.1:2379", value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Key prefix configs are stored under
    #[arg(long, default_value = "configurations/")]
    store_prefix: String,

    /// Timeout connecting to the store, in seconds
    #[arg(long, default_value = "5")]
    dial_timeout_secs: u64,

    // === Global Defaults ===
    /// Scrape interval for scrape configs that do not set one, in seconds
    #[arg(long, default_value = "60")]
    scrape_interval_secs: u64,

    /// Scrape timeout for scrape configs that do not set one, in seconds
    #[arg(long, default_value = "10")]
    scrape_timeout_secs: u64,
}

impl ServerArgs {
    fn into_config(self) -> NodeConfig {
        let advertise_addr = self.advertise_addr.unwrap_or_else(|| self.grpc_addr.to_string());
        NodeConfig {
            grpc_addr: self.grpc_addr,
            http_addr: self.http_addr,
            cluster: ClusterConfig {
                enabled: self.cluster,
                reshard_interval_ms: self.reshard_interval_secs * 1000,
                reshard_timeout_ms: self.reshard_timeout_secs * 1000,
                notify_timeout_ms: self.notify_timeout_secs * 1000,
                cluster_notify_timeout_ms: self.cluster_notify_timeout_secs * 1000,
                allow_local_file_reads: self.allow_local_file_reads,
                backoff: BackoffConfig {
                    min_backoff_ms: self.min_backoff_ms,
                    max_backoff_ms: self.max_backoff_ms,
                    max_retries: self.max_retries,
                },
            },
            lifecycler: LifecyclerConfig {
                instance_id: self.instance_id,
                advertise_addr,
                num_tokens: self.num_tokens,
                heartbeat_period_ms: self.heartbeat_period_secs * 1000,
                heartbeat_timeout_ms: self.heartbeat_timeout_secs * 1000,
                ring_key: self.ring_key,
            },
            store: StoreConfig {
                backend: match self.store {
                    Backend::Inmemory => StoreBackend::InMemory,
                    Backend::Etcd => StoreBackend::Etcd,
                },
                etcd_endpoints: self.etcd_endpoints,
                prefix: self.store_prefix,
                dial_timeout_ms: self.dial_timeout_secs * 1000,
            },
            global: GlobalConfig {
                scrape_interval: Duration::from_secs(self.scrape_interval_secs),
                scrape_timeout: Duration::from_secs(self.scrape_timeout_secs),
            },
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = args.into_config();
    if config.cluster.enabled && config.store.backend == StoreBackend::InMemory {
        tracing::warn!(
            "Clustering with the in-memory store only shares configs within this process. \
             Use --store etcd for a real fleet."
        );
    }

    let shutdown = install_shutdown_handler()?;
    let agent = Agent::new(config).await?;
    agent.run(shutdown).await?;

    tracing::info!("Agent shut down gracefully");
    Ok(())
}

async fn handle_reshard(addr: String, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr))?
        .connect_timeout(timeout)
        .timeout(timeout);
    let mut client = ScrapingServiceClient::new(endpoint.connect().await?);

    client.reshard(ReshardRequest {}).await?;
    println!("Reshard completed on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(*server_args).await?;
        }
        Commands::Reshard { addr, timeout_secs } => {
            handle_reshard(addr, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}
