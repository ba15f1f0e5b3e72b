use anyhow::{Context, Result};
use clap::Parser;
use lsmkv::server::{self, ConnLimit};
use lsmkv::{Engine, MemTableSize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(about = "Key-value store served over HTTP")]
struct Args {
    /// Interface to listen on.
    #[clap(long, env = "HOST", default_value = "localhost")]
    host: String,

    #[clap(short, long, env = "PORT", default_value = "9999")]
    port: u16,

    /// Directory holding the WAL and the tables. Created if missing.
    #[clap(short, long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Memtable entries limit, a flush happens once it is exceeded.
    #[clap(long)]
    memtable_size: Option<usize>,

    /// Maximum number of concurrent connections.
    #[clap(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let size = args.memtable_size.map_or(MemTableSize::Default, MemTableSize::Is);
    let limit = args.max_connections.map_or(ConnLimit::Default, ConnLimit::Is);

    let data_dir = args.data_dir.clone();
    // Recovery reads files, keep it off the runtime threads.
    let engine = tokio::task::spawn_blocking(move || Engine::open(&data_dir, size))
        .await?
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("opening store in {}", args.data_dir.display()))?;

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    if let Err(e) = server::run(listener, limit, Arc::new(engine), signal::ctrl_c()).await {
        error!("server exited with error: {}", e);
        return Err(anyhow::anyhow!(e));
    }

    info!("server stopped");

    Ok(())
}
