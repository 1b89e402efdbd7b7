//! vipnode RPC Server - the pool that hosts and clients connect to.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use vipnode_pool::{MemoryStore, PayPerInterval, PoolConfig, PoolDefaults, SqliteStore, Store, VipnodePool};

#[derive(Parser, Debug)]
#[command(name = "vipnode-rpc")]
#[command(about = "vipnode pool server")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// SQLite database path (defaults to an in-memory store)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Credit paid to a host per interval of client connection time
    #[arg(long, default_value_t = PoolDefaults::CREDIT_PER_INTERVAL)]
    credit_per_interval: i64,

    /// Billing interval in seconds
    #[arg(long, default_value_t = PoolDefaults::INTERVAL.as_secs())]
    interval_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting vipnode pool");

    let store: Arc<dyn Store> = match &args.db {
        Some(path) => {
            info!("Using database: {}", path.display());
            Arc::new(SqliteStore::open_at(path)?)
        }
        None => {
            info!("Using in-memory store, state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let ledger = Arc::new(PayPerInterval::new(
        Arc::clone(&store),
        args.credit_per_interval,
        Duration::from_secs(args.interval_secs),
    ));
    let pool = Arc::new(VipnodePool::new(store, ledger, PoolConfig::default()));

    let addr = vipnode_rpc::start_server(pool, &args.host, args.port).await?;
    info!("Pool running on ws://{}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
