/// Job submission: parses a spec file, enumerates its source files, and
/// queues one task per file.
///
/// Grounded in `memsql_loader/cli/load.py::RunLoad.queue_job`/`submit_files`
/// and `memsql_loader/api/job.py`. The original's command-line-option
/// surface (per-flag overrides of the spec, `--dry-run`, `--sync`,
/// `--force`) is out of scope (`SPEC_FULL.md` §4.J); this reads the spec
/// file as-is.
use std::path::Path;
use std::sync::Arc;

use loader_core::job_store::JobStore;
use loader_core::models::{Job, JobSpec};
use loader_core::queue::TaskQueue;
use loader_core::source::{self, SourceError};

/// Reads `spec_path`, validates it structurally, enumerates matching
/// source files, and persists the job plus one queued task per file. If
/// enumeration matches zero files the job is not persisted, mirroring the
/// original's "deleted ... it has no child tasks" behavior.
pub fn submit_job(jobs: &JobStore, queue: &TaskQueue, spec_path: &Path) -> anyhow::Result<Option<String>> {
    let raw = std::fs::read_to_string(spec_path)
        .map_err(|e| anyhow::anyhow!("unable to open spec file '{}': {e}", spec_path.display()))?;
    let spec: JobSpec = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse spec file '{}': {e}", spec_path.display()))?;

    validate_spec(&spec)?;

    let job = Job {
        id: uuid::Uuid::new_v4().simple().to_string(),
        created: chrono::Utc::now(),
        spec,
    };

    let driver = source::driver_for(&job.spec.source.scheme)?;
    let objects = match driver.list(&job) {
        Ok(objects) => objects,
        Err(SourceError::NoMatches(pattern)) => {
            tracing::warn!(pattern, "paths matched no files, not creating a job");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    jobs.save(&job)?;

    let mut count = 0usize;
    for object in &objects {
        queue.enqueue(
            &job.id,
            &serde_json::json!({ "scheme": job.spec.source.scheme, "name": object.name }),
            &object.file_id,
            None,
            Some(object.size as i64),
        )?;
        count += 1;
    }

    if count == 0 {
        tracing::info!(job_id = %job.id, "deleting job, it has no child tasks");
        jobs.delete(&job.id)?;
        return Ok(None);
    }

    tracing::info!(job_id = %job.id, tasks = count, "submitted job");
    Ok(Some(job.id))
}

/// The structural checks the original's `util/schema.py` performs on the
/// assembled spec before `Job()` construction: required fields non-empty
/// and the scheme recognised.
fn validate_spec(spec: &JobSpec) -> anyhow::Result<()> {
    if spec.connection.host.is_empty() {
        anyhow::bail!("spec.connection.host is required");
    }
    if spec.connection.user.is_empty() {
        anyhow::bail!("spec.connection.user is required");
    }
    if spec.target.database.is_empty() {
        anyhow::bail!("spec.target.database is required");
    }
    if spec.target.table.is_empty() {
        anyhow::bail!("spec.target.table is required");
    }
    if spec.source.pattern.is_empty() {
        anyhow::bail!("spec.source.pattern is required");
    }
    match spec.source.scheme.as_str() {
        "file" | "s3" | "hdfs" => {}
        other => anyhow::bail!("unrecognised source scheme '{other}'"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loader_core::store::Store;

    fn spec_json(pattern: &str) -> String {
        format!(
            r#"{{"connection":{{"host":"db1","port":3306,"user":"root","password":""}},
                "target":{{"database":"analytics","table":"events"}},
                "source":{{"scheme":"file","container":"","pattern":"{pattern}"}}}}"#
        )
    }

    #[test]
    fn submits_one_task_per_matching_file() {
        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path().join("s.db")).unwrap());
        let jobs = JobStore::new(store.clone());
        let queue = TaskQueue::new(store, std::time::Duration::from_secs(120));

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.csv"), b"1,2").unwrap();
        std::fs::write(src_dir.path().join("b.csv"), b"3,4").unwrap();

        let pattern = src_dir.path().join("*.csv");
        let spec_path = src_dir.path().join("spec.json");
        std::fs::write(&spec_path, spec_json(pattern.to_str().unwrap())).unwrap();

        let job_id = submit_job(&jobs, &queue, &spec_path).unwrap().expect("job created");
        let job = jobs.get(&job_id).unwrap();
        assert_eq!(job.spec.target.table, "events");

        let queued = queue
            .get_tasks_in_state(&[loader_core::models::TaskState::Queued], None)
            .unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[test]
    fn zero_matches_does_not_persist_a_job() {
        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path().join("s.db")).unwrap());
        let jobs = JobStore::new(store.clone());
        let queue = TaskQueue::new(store, std::time::Duration::from_secs(120));

        let src_dir = tempfile::tempdir().unwrap();
        let pattern = src_dir.path().join("*.nope");
        let spec_path = src_dir.path().join("spec.json");
        std::fs::write(&spec_path, spec_json(pattern.to_str().unwrap())).unwrap();

        let result = submit_job(&jobs, &queue, &spec_path).unwrap();
        assert!(result.is_none());
        assert!(jobs.all().unwrap().is_empty());
    }

    #[test]
    fn rejects_spec_missing_required_fields() {
        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path().join("s.db")).unwrap());
        let jobs = JobStore::new(store.clone());
        let queue = TaskQueue::new(store, std::time::Duration::from_secs(120));

        let spec_path = data_dir.path().join("spec.json");
        std::fs::write(
            &spec_path,
            r#"{"connection":{"host":"","port":3306,"user":"root"},"target":{"database":"d","table":"t"},"source":{"scheme":"file","pattern":"/tmp/*.csv"}}"#,
        )
        .unwrap();

        assert!(submit_job(&jobs, &queue, &spec_path).is_err());
    }
}
