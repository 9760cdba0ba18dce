// # Data plane
//
// The listener thread accepts and routes by shard selector; each shard
// worker thread runs its own readiness loop over its own memory. The only
// thing that ever crosses a thread boundary is a just-accepted stream.

pub mod conn;
pub mod listener;
pub mod proto;
pub mod worker;

pub use conn::{Conn, ConnState};
pub use listener::Listener;
pub use worker::{Worker, WorkerHandle, WorkerMsg};

use crate::config::CacheConfig;
use crate::error::Result;
use std::net::SocketAddr;
use tracing::info;

/// A running cache data plane: shard workers plus the listener.
pub struct CacheServer {
    addr: SocketAddr,
    workers: Vec<WorkerHandle>,
}

impl CacheServer {
    /// Spawn the shard workers and the listener. Threads live for the
    /// process; there is no graceful teardown beyond process exit.
    pub fn start(config: &CacheConfig) -> Result<Self> {
        config.validate()?;

        let mut workers = Vec::with_capacity(config.shards as usize);
        for shard in 0..config.shards {
            workers.push(worker::spawn(shard, config)?);
        }

        let listener = Listener::bind(config.clone(), workers.clone())?;
        let addr = listener.local_addr();
        std::thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || listener.run())?;

        info!(shards = config.shards, %addr, "cache server started");
        Ok(Self { addr, workers })
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Close every data-plane connection on every shard and wait for the
    /// acks; used by the version-upgrade path.
    pub fn drain_all(&self) {
        for worker in &self.workers {
            worker.drain();
        }
    }
}
