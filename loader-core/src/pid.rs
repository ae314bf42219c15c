/// The server liveness contract: a PID file under the data directory that
/// lets `loader-cli server start` refuse to double-start and `server
/// status`/`stop` find the running process.
///
/// Grounded in `memsql_loader/util/servers.py` (`write_pid_file`,
/// `get_server_pid`, `is_server_running`, `delete_pid_file`). The original
/// deletes the file via an `atexit` hook; we leave that to callers (the
/// server's shutdown path calls `delete_pid_file` explicitly once its poll
/// loop exits) since Rust has no process-wide exit-hook equivalent worth
/// reaching for here.
use std::fs;
use std::io;
use std::path::Path;

use crate::config::pid_file_path;

/// Writes the current process's PID to the data directory's PID file.
pub fn write_pid_file(data_dir: &Path) -> io::Result<()> {
    fs::write(pid_file_path(data_dir), format!("{}\n", std::process::id()))
}

/// Removes the PID file, ignoring a missing file.
pub fn delete_pid_file(data_dir: &Path) {
    let _ = fs::remove_file(pid_file_path(data_dir));
}

/// Reads the PID recorded in the data directory's PID file, if any.
pub fn read_pid(data_dir: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(pid_file_path(data_dir)) {
        Ok(contents) => Ok(contents.trim().parse::<u32>().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whether the PID recorded in the data directory belongs to a live process.
///
/// `kill(pid, 0)` sends no signal; it only checks that the process exists
/// and is visible to us.
pub fn is_running(data_dir: &Path) -> io::Result<bool> {
    let Some(pid) = read_pid(data_dir)? else {
        return Ok(false);
    };
    Ok(process_exists(pid))
}

fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        assert_eq!(read_pid(dir.path()).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn read_pid_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_pid(dir.path()).unwrap(), None);
    }

    #[test]
    fn is_running_true_for_self() {
        let dir = tempfile::tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        assert!(is_running(dir.path()).unwrap());
    }

    #[test]
    fn is_running_false_for_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        // PID 0 is never a real process id visible to kill(2) from userspace.
        fs::write(pid_file_path(dir.path()), "0\n").unwrap();
        assert!(!is_running(dir.path()).unwrap());
    }
}
