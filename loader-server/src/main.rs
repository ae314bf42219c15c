//! # memsql-loader server
//!
//! Supervises a pool of `loader-worker` processes that drain the embedded
//! task queue. Refuses to start a second instance against the same data
//! directory and records its own PID so `loader-cli server stop`/`status`
//! can find it.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p loader-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use loader_core::config;
use loader_core::queue::TaskQueue;
use loader_core::store::Store;
use loader_server::config::Config;
use loader_server::pool::WorkerPool;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loader_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("memsql-loader server v{} starting...", env!("CARGO_PKG_VERSION"));

    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)?;

    if loader_core::pid::is_running(&data_dir)? {
        tracing::error!("a server is already running against this data directory");
        anyhow::bail!("server already running");
    }
    loader_core::pid::write_pid_file(&data_dir)?;

    let result = run(data_dir.clone()).await;

    loader_core::pid::delete_pid_file(&data_dir);
    result
}

async fn run(data_dir: std::path::PathBuf) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let store = Arc::new(Store::open(config::store_path(&data_dir))?);
    let queue = Arc::new(TaskQueue::new(store.clone(), config::TASK_LEASE_TTL));
    let mut pool = WorkerPool::new(queue, config.num_workers, config.idle_timeout, data_dir);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tracing::info!("memsql-loader server running");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                let keep_going = tokio::task::block_in_place(|| pool.poll(&store))?;
                if !keep_going {
                    tracing::info!("queue idle past timeout, stopping");
                    break;
                }
            }
            _ = sigint.recv() => { tracing::info!("received SIGINT"); break; }
            _ = sigquit.recv() => { tracing::info!("received SIGQUIT"); break; }
            _ = sigterm.recv() => { tracing::info!("received SIGTERM"); break; }
        }
    }

    tracing::info!(workers = pool.worker_count(), "stopping worker pool");
    tokio::task::block_in_place(|| pool.stop());

    tracing::info!("server shut down gracefully");
    Ok(())
}
