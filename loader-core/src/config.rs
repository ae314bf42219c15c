/// Shared constants and filesystem layout.
///
/// Grounded in `memsql_loader/api/shared.py` (`TASKS_TTL`),
/// `memsql_loader/execution/downloader.py` (`DOWNLOAD_TIMEOUT`,
/// `SCRIPT_EXIT_TIMEOUT`), `memsql_loader/execution/worker.py`
/// (`HUNG_DOWNLOADER_TIMEOUT`), and `memsql_loader/util/servers.py`
/// (data directory / PID file path).
use std::path::PathBuf;
use std::time::Duration;

/// Lease time-to-live: a task not pinged within this window is reclaimable.
pub const TASK_LEASE_TTL: Duration = Duration::from_secs(120);

/// Stall detection for a single download: no >10 byte/s progress for this
/// long aborts the transfer with `DownloadError::Connection`.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// A downloader whose metrics haven't moved at all in this long is
/// considered hung outright, independent of the stall detector above.
pub const HUNG_DOWNLOADER_TIMEOUT: Duration = Duration::from_secs(3600);

/// After closing a script filter's stdin, how long to wait for it to exit
/// before killing it.
pub const SCRIPT_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker main-loop poll interval.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "MEMSQL_LOADER_DATA_DIRECTORY";

/// Resolves the data directory: `$MEMSQL_LOADER_DATA_DIRECTORY`, falling
/// back to `~/.memsql-loader`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_home().join(".memsql-loader")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Path to the embedded store's SQLite file within the data directory.
pub fn store_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("memsql_loader.db")
}

/// Path to the server's PID file within the data directory.
pub fn pid_file_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("memsql-loader.pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_path_is_nested_under_data_dir() {
        let dir = PathBuf::from("/tmp/example");
        assert_eq!(store_path(&dir), PathBuf::from("/tmp/example/memsql_loader.db"));
    }

    #[test]
    fn pid_file_path_is_nested_under_data_dir() {
        let dir = PathBuf::from("/tmp/example");
        assert_eq!(pid_file_path(&dir), PathBuf::from("/tmp/example/memsql-loader.pid"));
    }
}
