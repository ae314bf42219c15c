/// Persistence for `Job` records.
///
/// Grounded in `memsql_loader/loader_db/jobs.py`. Because `spec` is an
/// opaque JSON blob rather than decomposed columns, `query_target` mirrors
/// the original's approach of scanning every row and filtering in
/// application code, rather than pushing the filter into SQL.
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::error::JobError;
use crate::models::Job;
use crate::queue::to_rfc3339;
use crate::store::Store;

pub struct JobStore {
    store: Arc<Store>,
}

impl JobStore {
    pub fn new(store: Arc<Store>) -> Self {
        JobStore { store }
    }

    pub fn save(&self, job: &Job) -> Result<(), JobError> {
        let spec_json = serde_json::to_string(&job.spec)?;
        self.store.transaction(|tx| {
            tx.execute(
                "INSERT INTO jobs (id, created, spec) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET spec = excluded.spec",
                params![job.id, to_rfc3339(job.created), spec_json],
            )?;
            Ok(())
        }).map_err(Into::into)
    }

    pub fn delete(&self, id: &str) -> Result<(), JobError> {
        self.store.transaction(|tx| {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(())
        }).map_err(Into::into)
    }

    /// All jobs whose id starts with `id_prefix`, in `created` order. Used
    /// both by `get` to decide uniqueness and directly by callers (e.g.
    /// `cancel-job --multiple`) that want every match rather than exactly
    /// one.
    pub fn find_by_prefix(&self, id_prefix: &str) -> Result<Vec<Job>, JobError> {
        self.store.cursor(|conn| {
            let mut stmt = conn.prepare("SELECT id, created, spec FROM jobs WHERE id LIKE ?1 || '%' ORDER BY created ASC")?;
            let rows = stmt
                .query_map(params![id_prefix], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).map_err(Into::into)
    }

    /// Resolves a job by exact id or unambiguous hex prefix. Errors with
    /// `NotFound`/`AmbiguousPrefix` rather than returning `None`, matching
    /// the CLI-facing lookup semantics the original exposes.
    pub fn get(&self, id_prefix: &str) -> Result<Job, JobError> {
        let mut matches = self.find_by_prefix(id_prefix)?;

        match matches.len() {
            0 => Err(JobError::NotFound(id_prefix.to_string())),
            1 => Ok(matches.pop().unwrap()),
            _ => Err(JobError::AmbiguousPrefix(id_prefix.to_string())),
        }
    }

    pub fn all(&self) -> Result<Vec<Job>, JobError> {
        self.store.cursor(|conn| {
            let mut stmt = conn.prepare("SELECT id, created, spec FROM jobs ORDER BY created ASC")?;
            let rows = stmt
                .query_map([], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        }).map_err(Into::into)
    }

    /// All jobs whose connection + target scope exactly matches; used to
    /// find "competing" jobs for the same table when deciding whether a
    /// file's rows need deleting before reload (`SPEC_FULL.md` §4.G step 6).
    pub fn query_target(&self, host: &str, port: u16, database: &str, table: &str) -> Result<Vec<Job>, JobError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|job| {
                job.spec.connection.host == host
                    && job.spec.connection.port == port
                    && job.spec.target.database == database
                    && job.spec.target.table == table
            })
            .collect())
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let created_str: String = row.get("created")?;
    let spec_str: String = row.get("spec")?;
    Ok(Job {
        id: row.get("id")?,
        created: chrono::DateTime::parse_from_rfc3339(&created_str)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        spec: serde_json::from_str(&spec_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionSpec, JobSpec, LoadOptions, SourceSpec, TargetSpec};

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            created: chrono::Utc::now(),
            spec: JobSpec {
                connection: ConnectionSpec { host: "db1".into(), port: 3306, user: "root".into(), password: String::new() },
                target: TargetSpec { database: "analytics".into(), table: "events".into() },
                source: SourceSpec { scheme: "file".into(), container: String::new(), pattern: "/tmp/*.csv".into() },
                options: LoadOptions::default(),
            },
        }
    }

    fn store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("j.db")).unwrap());
        std::mem::forget(dir);
        store
    }

    #[test]
    fn save_and_get_by_prefix() {
        let js = JobStore::new(store());
        js.save(&sample_job("abcdef1234")).unwrap();

        let got = js.get("abcdef").unwrap();
        assert_eq!(got.id, "abcdef1234");
    }

    #[test]
    fn find_by_prefix_returns_every_match() {
        let js = JobStore::new(store());
        js.save(&sample_job("abc111")).unwrap();
        js.save(&sample_job("abc222")).unwrap();
        js.save(&sample_job("other")).unwrap();

        let matches = js.find_by_prefix("abc").unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn ambiguous_prefix_errors() {
        let js = JobStore::new(store());
        js.save(&sample_job("abc111")).unwrap();
        js.save(&sample_job("abc222")).unwrap();

        assert!(matches!(js.get("abc"), Err(JobError::AmbiguousPrefix(_))));
    }

    #[test]
    fn query_target_filters_by_scope() {
        let js = JobStore::new(store());
        js.save(&sample_job("job1")).unwrap();

        let mut other = sample_job("job2");
        other.spec.target.table = "other_table".into();
        js.save(&other).unwrap();

        let matches = js.query_target("db1", 3306, "analytics", "events").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "job1");
    }
}
