// # ShardCache Server
//
// Main entry point: initializes logging, loads configuration, and starts
// the data plane (listener + shard workers) and, when clustering is on, the
// Raft membership plane.

use shard_cache::{CacheConfig, CacheServer, Result, VERSION};
use tracing::info;

fn load_config() -> Result<CacheConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading configuration file");
            CacheConfig::from_file(path)
        }
        None => {
            let config = CacheConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("ShardCache {VERSION} starting");
    let config = load_config()?;
    info!(
        shards = config.shards,
        max_conn = config.max_conn,
        mem_limit = config.mem_limit,
        "configuration loaded"
    );

    let server = CacheServer::start(&config)?;
    info!(addr = %server.local_addr(), "data plane up");

    if config.cluster {
        let workers = server.workers().to_vec();
        let (peer_addr, admin_addr) = shard_cache::raft::spawn(config.clone(), workers)?;
        info!(%peer_addr, %admin_addr, "membership plane up");
    }

    // The planes run on their own threads; this thread has nothing left to
    // do but hold the process open.
    loop {
        std::thread::park();
    }
}
