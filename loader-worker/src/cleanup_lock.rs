/// Cross-worker serialisation for the delete-before-reload step.
///
/// Grounded in `memsql_loader/execution/worker.py`'s `multiprocessing.Lock`
/// guarding the duplicate-file cleanup delete. Workers are separate OS
/// processes here, so the original's in-process lock becomes an advisory
/// `flock` on a sentinel file under the data directory, one per
/// `(host, port, database, table)` scope.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct CleanupLock {
    _file: File,
}

impl CleanupLock {
    /// Blocks until the advisory lock for `scope_key` is acquired.
    pub fn acquire(data_dir: &Path, scope_key: &str) -> io::Result<Self> {
        let path = lock_path(data_dir, scope_key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(&path)?;

        let rc = unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&file), libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(CleanupLock { _file: file })
    }
}

impl Drop for CleanupLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(std::os::unix::io::AsRawFd::as_raw_fd(&self._file), libc::LOCK_UN) };
    }
}

fn lock_path(data_dir: &Path, scope_key: &str) -> PathBuf {
    let safe_key: String = scope_key.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    data_dir.join("locks").join(format!("{safe_key}.lock"))
}

pub fn scope_key(host: &str, port: u16, database: &str, table: &str) -> String {
    format!("{host}:{port}/{database}/{table}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_locks_for_different_scopes_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let a = CleanupLock::acquire(dir.path(), &scope_key("h", 1, "d", "a")).unwrap();
        let b = CleanupLock::acquire(dir.path(), &scope_key("h", 1, "d", "b")).unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn lock_path_sanitises_special_characters() {
        let dir = PathBuf::from("/tmp/data");
        let path = lock_path(&dir, "h:1/d/t");
        assert!(path.to_string_lossy().ends_with(".lock"));
        assert!(!path.to_string_lossy().contains(':'));
    }
}
