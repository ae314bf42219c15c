/// Configuration for the worker-pool supervisor process.
///
/// Grounded in `memsql_loader/cli/server.py`'s `server` subcommand options
/// (`--num-workers`) and `memsql_loader/execution/worker_pool.py`'s
/// `WorkerPool.__init__` defaults. Unlike the original, which takes these as
/// argparse flags threaded straight through `Server.run`, we read them from
/// the environment here so `main.rs` and `loader-cli`'s `server start`
/// subcommand agree on the same fallbacks.
use std::env;
use std::time::Duration;

/// Environment variable overriding the worker count.
pub const NUM_WORKERS_ENV: &str = "MEMSQL_LOADER_NUM_WORKERS";

/// Environment variable overriding the idle-exit timeout, in seconds. Unset
/// means "run forever", matching the original's `idle_timeout=None` default.
pub const IDLE_TIMEOUT_SECS_ENV: &str = "MEMSQL_LOADER_IDLE_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct Config {
    pub num_workers: Option<usize>,
    pub idle_timeout: Option<Duration>,
}

impl Config {
    /// Reads overrides from the environment; `None` fields fall back to
    /// `WorkerPool`'s own defaults (`pool::default_num_workers`, no idle
    /// timeout).
    pub fn from_env() -> anyhow::Result<Self> {
        let num_workers = match env::var(NUM_WORKERS_ENV) {
            Ok(v) => Some(v.parse::<usize>()?),
            Err(_) => None,
        };

        let idle_timeout = match env::var(IDLE_TIMEOUT_SECS_ENV) {
            Ok(v) => Some(Duration::from_secs(v.parse::<u64>()?)),
            Err(_) => None,
        };

        Ok(Config { num_workers, idle_timeout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_defaults_to_none() {
        env::remove_var(NUM_WORKERS_ENV);
        env::remove_var(IDLE_TIMEOUT_SECS_ENV);
        let config = Config::from_env().unwrap();
        assert_eq!(config.num_workers, None);
        assert_eq!(config.idle_timeout, None);
    }
}
