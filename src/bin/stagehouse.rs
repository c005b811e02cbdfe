//! Staging server.
//!
//! Usage:
//!   stagehouse --data-dir ./stagehouse --warehouse-dir ./warehouse --listen 127.0.0.1:7878

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stagehouse::warehouse::FileWarehouse;
use stagehouse::{SchedulerConfig, Server, ServerConfig, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "stagehouse")]
#[command(about = "Staging tuple store in front of a data warehouse")]
#[command(version)]
struct Args {
    /// Directory holding one subdirectory per table
    #[arg(short, long, default_value = "./stagehouse")]
    data_dir: PathBuf,

    /// Directory the file warehouse writes materialized rows to
    #[arg(short, long, default_value = "./warehouse")]
    warehouse_dir: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    listen: SocketAddr,

    /// Segment file size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    segment_size: usize,

    /// Sealed segments kept in memory per table
    #[arg(long, default_value_t = 64)]
    cache_capacity: usize,

    /// Milliseconds a fresh read waits for the producer before failing
    #[arg(long, default_value_t = 30_000)]
    accuracy_timeout_ms: u64,

    /// Seconds between garbage collection passes
    #[arg(long, default_value_t = 10)]
    gc_interval_secs: u64,

    /// Seconds between metrics reports
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> stagehouse::Result<()> {
    let store = StoreConfig::new(args.data_dir)
        .segment_size(args.segment_size)
        .segment_cache_capacity(args.cache_capacity)
        .accuracy_timeout(Duration::from_millis(args.accuracy_timeout_ms));
    let scheduler = SchedulerConfig::default()
        .gc_interval(Duration::from_secs(args.gc_interval_secs))
        .metrics_interval(Duration::from_secs(args.metrics_interval_secs));
    let config = ServerConfig::default()
        .listen_addr(args.listen)
        .store(store)
        .scheduler(scheduler);

    let warehouse = Arc::new(FileWarehouse::open(args.warehouse_dir)?);
    let server = Server::bind(config, warehouse).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
}
