/// The per-process worker main loop.
///
/// Grounded in `memsql_loader/execution/worker.py::Worker.run`. Runs on a
/// small Tokio runtime for orchestration (polling, cancellation, signal
/// handling idiom shared with the server), while the downloader and loader
/// each run on a dedicated blocking `std::thread` since their workloads are
/// blocking I/O (`SPEC_FULL.md` §5).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loader_core::config;
use loader_core::job_store::JobStore;
use loader_core::models::{Job, Task};
use loader_core::pipe::Pipe;
use loader_core::queue::{ExtraPredicate, TaskLease, TaskQueue};
use loader_core::source::SourceObject;
use loader_core::target_db::{LoadDataStmt, MySqlTargetConnection, TargetConnection};

use crate::bulk_load::{self, AbortGuard};
use crate::cleanup_lock::{self, CleanupLock};
use crate::downloader;
use crate::error::{self, reconcile, DownloadError, LoadError, ReconcileOutcome};
use crate::metrics::DownloadMetrics;

pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub jobs: Arc<JobStore>,
    pub data_dir: std::path::PathBuf,
    pub should_exit: Arc<AtomicBool>,
}

/// Runs the worker main loop until `should_exit` is observed. Returns once
/// a clean shutdown has requeued any in-flight task.
pub async fn run(ctx: WorkerContext) -> anyhow::Result<()> {
    // Desynchronise workers at startup (SPEC_FULL.md §4.G step 1).
    let jitter_ms: u64 = (std::process::id() as u64 % 250) + 1;
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

    loop {
        if ctx.should_exit.load(Ordering::SeqCst) {
            return Ok(());
        }

        let claimed = tokio::task::block_in_place(|| ctx.queue.claim(None))?;
        let (lease, task) = match claimed {
            Some(pair) => pair,
            None => {
                tokio::time::sleep(config::WORKER_POLL_INTERVAL).await;
                continue;
            }
        };

        if let Err(e) = run_task(&ctx, lease, task).await {
            tracing::error!(error = %e, "task attempt ended with an unhandled error");
        }
    }
}

async fn run_task(ctx: &WorkerContext, lease: TaskLease, task: Task) -> anyhow::Result<()> {
    let job = ctx.jobs.get(&task.job_id)?;

    if let Some(conn_id) = task.data.get("conn_id").and_then(|v| v.as_u64()) {
        tracing::info!(task_id = lease.task_id, conn_id, "killing stale connection from a prior lease");
        let _ = MySqlTargetConnection::kill(&job.spec.connection, conn_id).await;
    }

    let should_exit_for_task = ctx.should_exit.clone();
    let object = SourceObject {
        name: task
            .data
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        size: task.bytes_total.unwrap_or(0) as u64,
        file_id: task.file_id.clone(),
    };

    let gzip = object.name.ends_with(".gz") && job.spec.options.script.is_none();
    let pipe = Arc::new(Pipe::new(gzip)?);

    let delete_spec = match job.spec.options.file_id_column.clone() {
        Some(column) => prepare_duplicate_delete(ctx, &job, &task, &column).await?,
        None => None,
    };

    let metrics = Arc::new(Mutex::new(DownloadMetrics::new(task.bytes_total.map(|b| b as u64))));
    let abort_guard: AbortGuard = Arc::new(Mutex::new(bulk_load::ConnState::default()));

    {
        let pipe_for_abort = pipe.clone();
        let conn_spec = job.spec.connection.clone();
        let abort_guard = abort_guard.clone();
        pipe.attach_reader(move || {
            bulk_load::abort(&conn_spec, &abort_guard);
            let _ = &pipe_for_abort;
        });
    }

    ctx.queue.start_step(&lease, "download")?;
    let task = ctx.queue.refresh(&lease)?;

    let download_handle = {
        let job = job.clone();
        let pipe = pipe.clone();
        let metrics = metrics.clone();
        let should_exit = should_exit_for_task;
        std::thread::spawn(move || downloader::run(&job, &object, pipe, metrics, should_exit))
    };

    let stmt = LoadDataStmt {
        pipe_path: pipe.path().to_string_lossy().to_string(),
        database: job.spec.target.database.clone(),
        table: job.spec.target.table.clone(),
        compressed: gzip,
    };
    let load_handle = {
        let conn_spec = job.spec.connection.clone();
        let abort_guard = abort_guard.clone();
        std::thread::spawn(move || bulk_load::run(&conn_spec, &stmt, abort_guard, delete_spec))
    };

    let attempt = poll_until_done(ctx, &lease, task.clone(), &metrics, &abort_guard, download_handle, load_handle).await;
    pipe.cleanup();

    match attempt {
        Ok(TaskAttempt { outcome: ReconcileOutcome::Commit, row_count, .. }) => {
            let mut finished = ctx.queue.refresh(&lease)?;
            finished.bytes_downloaded = Some(metrics.lock().expect("metrics mutex poisoned").bytes_downloaded() as i64);
            if let Some(row_count) = row_count {
                if let Some(obj) = finished.data.as_object_mut() {
                    obj.insert("row_count".into(), serde_json::json!(row_count));
                }
            }
            ctx.queue.save(&lease, &finished)?;
            ctx.queue.finish(&lease, "success")?;
        }
        Ok(TaskAttempt { outcome: ReconcileOutcome::Requeue, .. }) => {
            ctx.queue.requeue(&lease)?;
        }
        Ok(TaskAttempt { outcome: ReconcileOutcome::Error, error_message, .. }) => {
            ctx.queue.error(&lease, &error_message.unwrap_or_else(|| "task failed".to_string()))?;
        }
        Ok(TaskAttempt { outcome: ReconcileOutcome::Dropped, .. }) => {}
        Err(e) => {
            tracing::error!(error = %e, task_id = lease.task_id, "worker-fatal error handling task");
            let _ = ctx.queue.requeue(&lease);
            return Err(e);
        }
    }

    Ok(())
}

/// The outcome of a single download+load attempt once both sides have
/// finished: what `reconcile` decided, plus whatever `row_count`/error text
/// the decision needs passed on to the queue.
struct TaskAttempt {
    outcome: ReconcileOutcome,
    row_count: Option<u64>,
    error_message: Option<String>,
}

async fn poll_until_done(
    ctx: &WorkerContext,
    lease: &TaskLease,
    mut task: Task,
    metrics: &Arc<Mutex<DownloadMetrics>>,
    abort_guard: &AbortGuard,
    download_handle: std::thread::JoinHandle<Result<downloader::DownloadOutcome, DownloadError>>,
    load_handle: std::thread::JoinHandle<Result<bulk_load::LoadOutcome, LoadError>>,
) -> anyhow::Result<TaskAttempt> {
    let mut download_handle = Some(download_handle);
    let mut load_handle = Some(load_handle);
    let mut download_result: Option<Result<downloader::DownloadOutcome, DownloadError>> = None;
    let mut load_result: Option<Result<bulk_load::LoadOutcome, LoadError>> = None;
    let mut conn_id_recorded = false;

    loop {
        tokio::time::sleep(config::WORKER_POLL_INTERVAL).await;

        if let Some(handle) = &download_handle {
            if handle.is_finished() {
                download_result = Some(download_handle.take().unwrap().join().unwrap_or_else(|_| {
                    Err(DownloadError::Worker("downloader thread panicked".into()))
                }));

                // Close the step regardless of outcome; an open step blocks
                // queue.finish() (SPEC_FULL.md §4.E step 2).
                match ctx.queue.stop_step(lease, "download") {
                    Ok(()) => {
                        if let Ok(refreshed) = ctx.queue.refresh(lease) {
                            task.steps = refreshed.steps;
                        }
                    }
                    Err(loader_core::error::QueueError::TaskDoesNotExist) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if let Some(handle) = &load_handle {
            if handle.is_finished() {
                load_result = Some(load_handle.take().unwrap().join().unwrap_or_else(|_| {
                    Err(LoadError::Worker("loader thread panicked".into()))
                }));
            }
        }

        let (bytes_downloaded, download_rate, time_left, stalled_too_long) = {
            let m = metrics.lock().expect("metrics mutex poisoned");
            (
                m.bytes_downloaded(),
                m.download_rate(),
                m.time_left(),
                m.seconds_since_last_change() > config::HUNG_DOWNLOADER_TIMEOUT,
            )
        };

        // Record the loader's connection id into task.data.conn_id as soon
        // as it is known (SPEC_FULL.md §4.F step 1), so a later crash
        // recovery can kill the same connection (worker.rs's stale-conn_id
        // check at task start).
        if !conn_id_recorded {
            if let Some(conn_id) = abort_guard.lock().expect("abort guard poisoned").connection_id {
                if let Some(obj) = task.data.as_object_mut() {
                    obj.insert("conn_id".into(), serde_json::Value::from(conn_id));
                }
                conn_id_recorded = true;
            }
        }
        if let Some(obj) = task.data.as_object_mut() {
            obj.insert("time_left".into(), serde_json::json!(time_left));
        }
        task.bytes_downloaded = Some(bytes_downloaded as i64);
        task.download_rate = Some(download_rate);

        match ctx.queue.save(lease, &task) {
            Ok(()) => {}
            Err(loader_core::error::QueueError::TaskDoesNotExist) => {
                if let Some(h) = download_handle.take() {
                    let _ = h.join();
                }
                if let Some(h) = load_handle.take() {
                    let _ = h.join();
                }
                return Ok(TaskAttempt { outcome: ReconcileOutcome::Dropped, row_count: None, error_message: None });
            }
            Err(e) => return Err(e.into()),
        }

        match ctx.queue.ping(lease) {
            Ok(()) => {}
            Err(loader_core::error::QueueError::TaskDoesNotExist) => {
                if let Some(h) = download_handle.take() {
                    let _ = h.join();
                }
                if let Some(h) = load_handle.take() {
                    let _ = h.join();
                }
                return Ok(TaskAttempt { outcome: ReconcileOutcome::Dropped, row_count: None, error_message: None });
            }
            Err(e) => return Err(e.into()),
        }

        if stalled_too_long {
            ctx.should_exit.store(true, Ordering::SeqCst);
        }

        if download_result.is_some() && load_result.is_some() {
            let d_err = download_result.as_ref().and_then(|r| r.as_ref().err());
            let l_err = load_result.as_ref().and_then(|r| r.as_ref().err());
            let outcome = reconcile(d_err, l_err);
            let row_count = load_result.as_ref().and_then(|r| r.as_ref().ok()).map(|o| o.row_count);
            let error_message = matches!(outcome, ReconcileOutcome::Error).then(|| error::error_message(d_err, l_err));
            return Ok(TaskAttempt { outcome, row_count, error_message });
        }
    }
}

/// Decides whether this file has already been loaded once under the same
/// `(host, port, db, table)` scope (possibly by a different job) and, if
/// so, acquires the cross-worker cleanup lock and returns a `DeleteSpec`
/// for the loader thread to run inside its load transaction
/// (`SPEC_FULL.md` §4.G step 6). The delete itself does not run here: only
/// the loader thread's connection participates in the transaction that
/// must commit or roll back together with the bulk-load statement.
async fn prepare_duplicate_delete(
    ctx: &WorkerContext,
    job: &Job,
    task: &Task,
    column: &str,
) -> anyhow::Result<Option<bulk_load::DeleteSpec>> {
    let duplicates = ctx.jobs.query_target(
        &job.spec.connection.host,
        job.spec.connection.port,
        &job.spec.target.database,
        &job.spec.target.table,
    )?;
    if duplicates.len() <= 1 {
        return Ok(None);
    }

    let already_loaded = ctx.queue.get_tasks_in_state(
        &[loader_core::models::TaskState::Success],
        Some(&ExtraPredicate::FileIdInJobs {
            file_id: task.file_id.clone(),
            job_ids: duplicates.iter().map(|j| j.id.clone()).collect(),
        }),
    )?;
    if already_loaded.is_empty() {
        return Ok(None);
    }

    let scope = cleanup_lock::scope_key(
        &job.spec.connection.host,
        job.spec.connection.port,
        &job.spec.target.database,
        &job.spec.target.table,
    );
    let data_dir = ctx.data_dir.clone();
    let lock: CleanupLock = tokio::task::spawn_blocking(move || CleanupLock::acquire(&data_dir, &scope)).await??;

    Ok(Some(bulk_load::DeleteSpec {
        database: job.spec.target.database.clone(),
        table: job.spec.target.table.clone(),
        column: column.to_string(),
        file_id: task.file_id.clone(),
        lock,
    }))
}
