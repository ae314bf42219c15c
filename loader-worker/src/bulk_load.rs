/// The loader thread: reads the pipe through the target database's
/// bulk-load statement over one exclusive, non-pooled connection.
///
/// Grounded in `memsql_loader/execution/loader.py` and
/// `memsql_loader/db/load_data.py`. The connection is not a pooled one
/// because its transaction must survive across the whole delete+load
/// sequence: this thread owns the connection end-to-end (connect, `BEGIN`,
/// optional delete-before-reload, the bulk-load statement, `COMMIT`) so the
/// two statements commit or roll back together rather than as independent
/// autocommitted units.
use std::sync::{Arc, Mutex};

use loader_core::models::job::ConnectionSpec;
use loader_core::target_db::{LoadDataStmt, MySqlTargetConnection, TargetConnection};

use crate::cleanup_lock::CleanupLock;
use crate::error::LoadError;

pub struct LoadOutcome {
    pub row_count: u64,
    pub connection_id: u64,
}

/// The delete-before-reload step, run inside the same transaction as the
/// bulk-load statement that follows it (`SPEC_FULL.md` §4.G step 6). The
/// cross-worker cleanup lock is held until the delete itself completes,
/// then dropped before the (potentially long) bulk-load statement runs.
pub struct DeleteSpec {
    pub database: String,
    pub table: String,
    pub column: String,
    pub file_id: String,
    pub lock: CleanupLock,
}

/// Shared state between the loader thread and the pipe's abort hook:
/// the loader records its connection id here as soon as it is known
/// (`SPEC_FULL.md` §4.F step 1) so a concurrent abort can target it, and
/// `abort()` flags `aborted` so the happy path can observe the race
/// deterministically.
#[derive(Default)]
pub struct ConnState {
    pub aborted: bool,
    pub connection_id: Option<u64>,
}

pub type AbortGuard = Arc<Mutex<ConnState>>;

/// Runs the bulk-load statement on its own small Tokio runtime, since the
/// loader thread itself is a plain `std::thread` per `SPEC_FULL.md` §5 but
/// `sqlx` is async.
pub fn run(
    conn_spec: &ConnectionSpec,
    stmt: &LoadDataStmt,
    abort_guard: AbortGuard,
    delete: Option<DeleteSpec>,
) -> Result<LoadOutcome, LoadError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LoadError::Worker(e.to_string()))?;

    rt.block_on(async {
        let mut conn = MySqlTargetConnection::connect(conn_spec)
            .await
            .map_err(|e| LoadError::Connection(e.to_string()))?;

        let connection_id = conn.connection_id().await.map_err(|e| LoadError::Connection(e.to_string()))?;

        {
            let mut guard = abort_guard.lock().expect("abort guard poisoned");
            guard.connection_id = Some(connection_id);
            if guard.aborted {
                return Err(LoadError::Worker("aborted before load started".into()));
            }
        }

        conn.begin().await.map_err(|e| LoadError::Connection(e.to_string()))?;

        if let Some(delete) = delete {
            let deleted = conn
                .delete_by_file_id(&delete.database, &delete.table, &delete.column, &delete.file_id)
                .await
                .map_err(|e| {
                    if e.is_connection_class() {
                        LoadError::Connection(e.to_string())
                    } else {
                        LoadError::Worker(e.to_string())
                    }
                });
            // Release the cross-worker lock as soon as the delete itself is
            // done; the bulk-load that follows can be long-running and
            // needn't serialise other workers' deletes behind it.
            drop(delete.lock);
            let deleted = deleted?;
            tracing::info!(deleted, "deleted pre-existing rows for this file id before reload");
        }

        let row_count = match conn.exec_load(stmt).await {
            Ok(n) => n,
            Err(e) => {
                let _ = conn.rollback().await;
                return Err(if e.is_connection_class() {
                    LoadError::Connection(e.to_string())
                } else {
                    LoadError::Worker(e.to_string())
                });
            }
        };

        conn.commit().await.map_err(|e| LoadError::Connection(e.to_string()))?;

        Ok(LoadOutcome { row_count, connection_id })
    })
}

/// Opens a second connection and issues `KILL <connection_id>`, callable
/// from the pipe's abort hook. Holds `abort_guard` for the duration so a
/// concurrent normal-completion path observes the abort deterministically.
/// A no-op if the loader hasn't connected yet (nothing to kill; `run` will
/// observe `aborted` and bail before executing the load).
pub fn abort(conn_spec: &ConnectionSpec, abort_guard: &AbortGuard) {
    let connection_id = {
        let mut guard = abort_guard.lock().expect("abort guard poisoned");
        guard.aborted = true;
        guard.connection_id
    };
    let Some(connection_id) = connection_id else {
        return;
    };

    let spec = conn_spec.clone();
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "failed to build runtime for connection kill");
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = MySqlTargetConnection::kill(&spec, connection_id).await {
                tracing::warn!(error = %e, connection_id, "failed to kill loader connection");
            }
        });
    });
}
