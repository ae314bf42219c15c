//! # memsql-loader worker
//!
//! A single worker process: claims tasks from the embedded store one at a
//! time and runs each through the downloader/loader pipeline
//! (`loader_worker::worker::run`).
//!
//! ## Architecture
//!
//! The worker:
//! - Polls the task queue for a claimable task every `WORKER_POLL_INTERVAL`
//! - Runs its downloader and loader on dedicated blocking threads, linked
//!   by a named pipe
//! - Pings its lease and watches for a hung downloader while the threads run
//! - Exits cleanly on SIGINT/SIGQUIT/SIGTERM, or if its parent (the
//!   `loader-server` that spawned it) disappears
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p loader-worker
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loader_core::config;
use loader_core::job_store::JobStore;
use loader_core::queue::TaskQueue;
use loader_core::store::Store;
use loader_worker::worker::{self, WorkerContext};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loader_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("memsql-loader worker v{} starting...", env!("CARGO_PKG_VERSION"));

    let data_dir = config::data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(Store::open(config::store_path(&data_dir))?);
    let queue = Arc::new(TaskQueue::new(store.clone(), config::TASK_LEASE_TTL));
    let jobs = Arc::new(JobStore::new(store));

    let should_exit = Arc::new(AtomicBool::new(false));

    spawn_signal_watcher(should_exit.clone())?;
    spawn_parent_watchdog(should_exit.clone());

    let ctx = WorkerContext {
        queue,
        jobs,
        data_dir,
        should_exit,
    };

    worker::run(ctx).await?;

    tracing::info!("worker exiting cleanly");
    Ok(())
}

/// Flips `should_exit` on SIGINT, SIGQUIT, or SIGTERM, mirroring the
/// original's `signal.signal(SIGINT/SIGQUIT/SIGTERM, handle_signal)`
/// (`memsql_loader/execution/worker.py`).
fn spawn_signal_watcher(should_exit: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigquit.recv() => tracing::info!("received SIGQUIT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        should_exit.store(true, Ordering::SeqCst);
    });

    Ok(())
}

/// Detects the loader-server that spawned this process exiting without
/// cleanly stopping us first. `loader-server` launches workers as real OS
/// children via `std::process::Command` (not `fork()`ed multiprocessing
/// workers sharing a parent-pid argument), so `getppid()` alone is enough:
/// a dead parent reparents us to init, which changes the observed ppid.
fn spawn_parent_watchdog(should_exit: Arc<AtomicBool>) {
    let initial_ppid = unsafe { libc::getppid() };

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if should_exit.load(Ordering::SeqCst) {
                return;
            }
            let ppid = unsafe { libc::getppid() };
            if ppid != initial_ppid {
                tracing::warn!(initial_ppid, ppid, "parent process changed, assuming server died");
                should_exit.store(true, Ordering::SeqCst);
                return;
            }
        }
    });
}
