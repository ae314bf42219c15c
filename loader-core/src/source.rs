/// Source object enumeration and retrieval.
///
/// Grounded in `memsql_loader/loader_db/jobs.py::Job.get_files` and the
/// scheme-specific readers under `memsql_loader/util/` (`s3_utils.py`,
/// `hdfs_utils.py`). The `file` scheme is fully implemented against the
/// local filesystem; `s3`/`hdfs` are left as documented stubs since the
/// object-storage SDKs they'd need are outside this crate's dependency
/// stack (see `DESIGN.md`).
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::models::Job;

#[derive(Debug, Clone)]
pub struct SourceObject {
    /// Opaque locator passed back into `SourceDriver::open`.
    pub name: String,
    pub size: u64,
    pub file_id: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no objects match pattern '{0}'")]
    NoMatches(String),
    #[error("source scheme '{0}' is not supported in this build")]
    Unsupported(String),
}

/// A stream of bytes plus the total size, if known up front (used to drive
/// the downloader's throughput percentage; see `SPEC_FULL.md` §4.E).
pub trait SourceStream: Read + Send {}
impl<T: Read + Send> SourceStream for T {}

pub trait SourceDriver: Send + Sync {
    /// Lists every object matching the job's source pattern.
    fn list(&self, job: &Job) -> Result<Vec<SourceObject>, SourceError>;

    /// Opens a single object for sequential reading.
    fn open(&self, job: &Job, object: &SourceObject) -> Result<Box<dyn SourceStream>, SourceError>;
}

pub fn driver_for(scheme: &str) -> Result<Box<dyn SourceDriver>, SourceError> {
    match scheme {
        "file" => Ok(Box::new(FileSourceDriver)),
        "s3" => Ok(Box::new(UnsupportedDriver { scheme: "s3" })),
        "hdfs" => Ok(Box::new(UnsupportedDriver { scheme: "hdfs" })),
        other => Err(SourceError::Unsupported(other.to_string())),
    }
}

/// Reads from the local filesystem; `pattern` is a glob rooted at `/`.
pub struct FileSourceDriver;

impl SourceDriver for FileSourceDriver {
    fn list(&self, job: &Job) -> Result<Vec<SourceObject>, SourceError> {
        let pattern = &job.spec.source.pattern;
        let mut objects = Vec::new();

        for entry in glob_paths(pattern)? {
            let meta = std::fs::metadata(&entry)?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.to_string_lossy().to_string();
            let file_id = Job::file_id(&job.spec.source.container, &name);
            objects.push(SourceObject { name, size: meta.len(), file_id });
        }

        if objects.is_empty() {
            return Err(SourceError::NoMatches(pattern.clone()));
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    fn open(&self, _job: &Job, object: &SourceObject) -> Result<Box<dyn SourceStream>, SourceError> {
        Ok(Box::new(std::fs::File::open(&object.name)?))
    }
}

/// Expands a glob pattern without pulling in a glob crate: splits on the
/// last path separator, matches the directory exactly and the filename
/// component against `*`/`?` wildcards. Sufficient for the flat,
/// single-directory patterns the loader is pointed at in practice; a
/// pattern with wildcards in an intermediate directory component falls
/// back to treating the whole pattern as a literal path.
fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>, std::io::Error> {
    let path = Path::new(pattern);
    if !pattern.contains('*') && !pattern.contains('?') {
        return Ok(vec![path.to_path_buf()]);
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_pattern = path.file_name().and_then(|s| s.to_str()).unwrap_or("*");

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if glob_match(file_pattern, &name) {
            matches.push(entry.path());
        }
    }
    Ok(matches)
}

fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

struct UnsupportedDriver {
    scheme: &'static str,
}

impl SourceDriver for UnsupportedDriver {
    fn list(&self, _job: &Job) -> Result<Vec<SourceObject>, SourceError> {
        Err(SourceError::Unsupported(self.scheme.to_string()))
    }

    fn open(&self, _job: &Job, _object: &SourceObject) -> Result<Box<dyn SourceStream>, SourceError> {
        Err(SourceError::Unsupported(self.scheme.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionSpec, JobSpec, LoadOptions, SourceSpec, TargetSpec};

    fn job_for_pattern(pattern: &str) -> Job {
        Job {
            id: "j".into(),
            created: chrono::Utc::now(),
            spec: JobSpec {
                connection: ConnectionSpec { host: "h".into(), port: 3306, user: "u".into(), password: String::new() },
                target: TargetSpec { database: "d".into(), table: "t".into() },
                source: SourceSpec { scheme: "file".into(), container: String::new(), pattern: pattern.to_string() },
                options: LoadOptions::default(),
            },
        }
    }

    #[test]
    fn lists_matching_files_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), b"1").unwrap();
        std::fs::write(dir.path().join("b.csv"), b"22").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"333").unwrap();

        let pattern = dir.path().join("*.csv");
        let driver = FileSourceDriver;
        let job = job_for_pattern(pattern.to_str().unwrap());
        let mut objects = driver.list(&job).unwrap();
        objects.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(objects.len(), 2);
        assert!(objects.iter().any(|o| o.name.ends_with("a.csv") && o.size == 1));
        assert!(objects.iter().any(|o| o.name.ends_with("b.csv") && o.size == 2));
    }

    #[test]
    fn no_matches_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.nope");
        let driver = FileSourceDriver;
        let job = job_for_pattern(pattern.to_str().unwrap());
        assert!(matches!(driver.list(&job), Err(SourceError::NoMatches(_))));
    }

    #[test]
    fn unsupported_schemes_error_cleanly() {
        assert!(driver_for("s3").is_ok());
        let driver = driver_for("s3").unwrap();
        let job = job_for_pattern("whatever");
        assert!(matches!(driver.list(&job), Err(SourceError::Unsupported(_))));
    }

    #[test]
    fn unknown_scheme_errors_at_lookup() {
        assert!(matches!(driver_for("ftp"), Err(SourceError::Unsupported(_))));
    }
}
