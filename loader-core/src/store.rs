/// The embedded SQL store: two long-lived connections over one WAL-mode
/// SQLite file, fork-safe, with a cross-process write mutex.
///
/// Grounded in `memsql_loader/util/apsw_storage.py` (`APSWStorage`:
/// dual connections, busy timeout, pragma setup, `transaction()`/`cursor()`,
/// checkpoint-ignoring-busy) and `memsql_loader/loader_db/storage.py`
/// (`fork_wrapper`). Unlike the original's process-wide `LoaderStorage`
/// singleton, `Store` is an explicit value threaded through the pool and
/// workers (see `SPEC_FULL.md` §9, Open Question #5): there is no global
/// mutable state to manage here, only one `Store` whose handles are closed
/// and reopened around a fork point.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};

use crate::error::StoreError;

const BUSY_TIMEOUT_MS: u32 = 60_000;

pub struct Store {
    path: PathBuf,
    write: Mutex<Option<Connection>>,
    read: Mutex<Option<Connection>>,
}

impl Store {
    /// Opens (creating if absent) the store file at `path` and applies the
    /// original's pragma contract: WAL journaling, `synchronous=NORMAL`,
    /// foreign keys on, and a 60s busy timeout on both handles.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                    Some(e.to_string()),
                ))
            })?;
        }

        let write = Self::open_connection(&path)?;
        let read = Self::open_connection(&path)?;

        let store = Store {
            path,
            write: Mutex::new(Some(write)),
            read: Mutex::new(Some(read)),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn open_connection(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", 1)?; // NORMAL
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    created TEXT NOT NULL,
                    spec TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL,
                    created TEXT NOT NULL,
                    data TEXT NOT NULL,
                    file_id TEXT NOT NULL,
                    md5 TEXT,
                    bytes_total INTEGER,
                    bytes_downloaded INTEGER,
                    download_rate REAL,
                    execution_id TEXT,
                    started TEXT,
                    last_contact TEXT,
                    finished TEXT,
                    result TEXT,
                    steps TEXT NOT NULL DEFAULT '[]',
                    update_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS tasks_created_idx ON tasks(created);
                CREATE INDEX IF NOT EXISTS tasks_started_idx ON tasks(started);
                CREATE INDEX IF NOT EXISTS tasks_last_contact_idx ON tasks(last_contact);
                CREATE INDEX IF NOT EXISTS tasks_job_id_idx ON tasks(job_id);
                CREATE INDEX IF NOT EXISTS tasks_file_id_idx ON tasks(file_id);
                ",
            )?;
            Ok(())
        })
    }

    /// Runs `f` inside a write transaction on the dedicated write
    /// connection, serialised by this process's write mutex, then commits
    /// and opportunistically checkpoints the WAL (ignoring busy/locked
    /// errors on checkpoint, matching the original).
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.write.lock().expect("write mutex poisoned");
        let conn = guard.as_mut().expect("store handles closed (inside with_fork?)");

        let tx = conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;

        Self::checkpoint_ignoring_busy(conn);
        Ok(result)
    }

    /// Runs `f` against the dedicated read connection.
    pub fn cursor<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.read.lock().expect("read mutex poisoned");
        let conn = guard.as_ref().expect("store handles closed (inside with_fork?)");
        f(conn)
    }

    fn checkpoint_ignoring_busy(conn: &Connection) {
        let _ = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()));
    }

    /// Closes both handles, runs `f`, then reopens fresh handles. Any code
    /// that spawns a child process (which would otherwise inherit, and
    /// potentially corrupt, these handles) must wrap the spawn in this
    /// scope.
    pub fn with_fork<T>(&self, f: impl FnOnce() -> T) -> Result<T, StoreError> {
        {
            let mut w = self.write.lock().expect("write mutex poisoned");
            let mut r = self.read.lock().expect("read mutex poisoned");
            *w = None;
            *r = None;
        }

        let result = f();

        {
            let mut w = self.write.lock().expect("write mutex poisoned");
            let mut r = self.read.lock().expect("read mutex poisoned");
            *w = Some(Self::open_connection(&self.path)?);
            *r = Some(Self::open_connection(&self.path)?);
        }

        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let count: i64 = store
            .cursor(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs','tasks')",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn with_fork_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();

        let result = store.with_fork(|| 42).unwrap();
        assert_eq!(result, 42);

        // handles must be usable again after with_fork returns
        let count: i64 = store
            .cursor(|conn| Ok(conn.query_row("SELECT count(*) FROM tasks", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();

        let outcome: Result<(), StoreError> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO jobs (id, created, spec) VALUES ('x', '2024-01-01', '{}')",
                [],
            )?;
            Err(StoreError::Sqlite(rusqlite::Error::ExecuteReturnedResults))
        });
        assert!(outcome.is_err());

        let count: i64 = store
            .cursor(|conn| Ok(conn.query_row("SELECT count(*) FROM jobs", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
