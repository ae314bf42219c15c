/// Shared error types for the embedded task queue and job store.
///
/// Mirrors the exception hierarchy of `apsw_sql_step_queue/errors.py` and
/// `loader_db/jobs.py`: a lost lease, a step-lifecycle violation, and a
/// terminal-state violation are distinct, catchable conditions rather than
/// generic database errors.
use thiserror::Error;

/// What `Store::transaction`/`cursor` themselves can fail with. Callers
/// with their own error type (`TaskQueue` -> `QueueError`, `JobStore` ->
/// `JobError`) convert out of this via the `From` impls below so `?` works
/// directly inside their methods.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by `TaskQueue` operations.
///
/// Grounded in `apsw_sql_step_queue/errors.py` (`TaskDoesNotExist`,
/// `StepRunning`, `AlreadyFinished`, `StepAlreadyStarted`, `StepNotStarted`).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The lease is gone: the task was finished, cancelled, requeued, or its
    /// TTL expired since the handle was obtained. Callers should drop the
    /// handle rather than retry.
    #[error("task does not exist or lease has expired")]
    TaskDoesNotExist,

    /// `finish()` or `requeue()` was called while a step was still running.
    #[error("a step is still running")]
    StepRunning,

    /// `finish()` was called twice on the same lease.
    #[error("task is already finished")]
    AlreadyFinished,

    /// `start_step(name)` was called for a name with an open (unstopped) entry.
    #[error("step '{0}' was already started")]
    StepAlreadyStarted(String),

    /// `stop_step(name)` was called for a name with no open entry.
    #[error("step '{0}' was not started")]
    StepNotStarted(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Sqlite(e) => QueueError::Sqlite(e),
            StoreError::Json(e) => QueueError::Json(e),
        }
    }
}

/// Errors raised by `JobStore` operations, grounded in `loader_db/jobs.py`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no job matches id prefix '{0}'")]
    NotFound(String),

    #[error("id prefix '{0}' matches more than one job")]
    AmbiguousPrefix(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Sqlite(e) => JobError::Sqlite(e),
            StoreError::Json(e) => JobError::Json(e),
        }
    }
}
