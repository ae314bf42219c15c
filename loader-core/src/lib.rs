//! Embedded store, task queue, and job persistence shared by the loader
//! worker and server processes.
//!
//! ## Module organization
//!
//! - `store`: the dual-connection SQLite handle (`Store`)
//! - `models`: `Job`/`Task` record types and derived state
//! - `queue`: the optimistic task-claim queue (`TaskQueue`)
//! - `job_store`: `Job` CRUD and lookup
//! - `pipe`: named-pipe plumbing between downloader and loader
//! - `source`: source object enumeration (`file`/`s3`/`hdfs`)
//! - `target_db`: the target database connection contract
//! - `config`: shared constants and data-directory resolution
//! - `pid`: the server liveness PID file contract (§6)
//! - `error`: common error types

pub mod config;
pub mod error;
pub mod job_store;
pub mod models;
pub mod pid;
pub mod pipe;
pub mod queue;
pub mod source;
pub mod store;
pub mod target_db;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
