/// The worker-pool supervisor.
///
/// Grounded in `memsql_loader/execution/worker_pool.py::WorkerPool`. The
/// original's `_workers` are `multiprocessing.Process` handles sharing a
/// `multiprocessing.Value`-backed `is_working()` flag with their parent;
/// here each worker is an independently-spawned OS process
/// (`std::process::Command`), so there is no shared memory to read a
/// busy/idle flag out of. Instead `poll` asks the store directly: any task
/// in `Running` state means the pool is doing work (`SPEC_FULL.md` §4.H,
/// Open Question #5).
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use loader_core::config;
use loader_core::models::TaskState;
use loader_core::queue::TaskQueue;
use loader_core::store::Store;

pub struct WorkerPool {
    queue: std::sync::Arc<TaskQueue>,
    num_workers: usize,
    idle_timeout: Option<Duration>,
    data_dir: PathBuf,
    children: Vec<Child>,
    last_work_time: Instant,
}

impl WorkerPool {
    pub fn new(
        queue: std::sync::Arc<TaskQueue>,
        num_workers: Option<usize>,
        idle_timeout: Option<Duration>,
        data_dir: PathBuf,
    ) -> Self {
        WorkerPool {
            queue,
            num_workers: num_workers.unwrap_or_else(default_num_workers),
            idle_timeout,
            data_dir,
            children: Vec::new(),
            last_work_time: Instant::now(),
        }
    }

    /// Reaps dead children, tops the pool back up to `num_workers`, and
    /// reports whether the pool should keep running. Returns `Ok(false)`
    /// once the queue has sat idle past `idle_timeout`, matching the
    /// original's `poll()` returning `False` to tell `Server.run` to stop.
    pub fn poll(&mut self, store: &Store) -> anyhow::Result<bool> {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(_status)) => false,
            Ok(None) => true,
            Err(_) => false,
        });

        if let Some(idle_timeout) = self.idle_timeout {
            let running = self.queue.get_tasks_in_state(&[TaskState::Running], None)?;
            if !running.is_empty() {
                self.last_work_time = Instant::now();
            } else if self.last_work_time.elapsed() > idle_timeout {
                return Ok(false);
            }
        }

        let deficit = self.num_workers.saturating_sub(self.children.len());
        if deficit > 0 {
            tracing::debug!(deficit, total = self.num_workers, "starting workers");
            let data_dir = self.data_dir.clone();
            let spawned = store.with_fork(|| {
                (0..deficit)
                    .filter_map(|_| match spawn_worker(&data_dir) {
                        Ok(child) => Some(child),
                        Err(e) => {
                            tracing::error!(error = %e, "failed to spawn worker");
                            None
                        }
                    })
                    .collect::<Vec<_>>()
            })?;
            self.children.extend(spawned);
        }

        Ok(true)
    }

    /// Sends SIGTERM to every live child and waits up to 30 seconds for
    /// them to exit, matching `Worker.signal_exit`/`Worker.join` in the
    /// original.
    pub fn stop(&mut self) {
        for child in &self.children {
            unsafe {
                libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(30);
        self.children.retain_mut(|child| {
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(_)) => return false,
                    Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                    Err(_) => return false,
                }
            }
            let _ = child.kill();
            let _ = child.wait();
            false
        });
    }

    pub fn worker_count(&self) -> usize {
        self.children.len()
    }
}

/// `max(1, floor(0.8 * available_parallelism))`, mirroring
/// `max(1, int(multiprocessing.cpu_count() * 0.8))`.
pub fn default_num_workers() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    std::cmp::max(1, (cpus as f64 * 0.8) as usize)
}

fn spawn_worker(data_dir: &std::path::Path) -> std::io::Result<Child> {
    let worker_bin = sibling_binary("loader-worker")?;
    Command::new(worker_bin)
        .env(config::DATA_DIR_ENV, data_dir)
        .spawn()
}

/// Locates a binary installed alongside the currently-running executable,
/// the way `loader-server` finds its `loader-worker` sibling without
/// depending on `$PATH`.
fn sibling_binary(name: &str) -> std::io::Result<PathBuf> {
    let mut path = std::env::current_exe()?;
    path.pop();
    path.push(name);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_num_workers_is_at_least_one() {
        assert!(default_num_workers() >= 1);
    }
}
