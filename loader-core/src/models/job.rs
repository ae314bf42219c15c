/// The `Job` record: a user-submitted load request.
///
/// Grounded in `memsql_loader/loader_db/jobs.py`. `spec` is carried as an
/// opaque JSON blob exactly as the original stores it (the original's
/// `Spec` class is a thin schema-validated wrapper over the same JSON, not
/// a set of real columns) so new option fields never require a migration.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub created: DateTime<Utc>,
    pub spec: JobSpec,
}

/// The parsed shape of `spec.json`. Deliberately permissive about anything
/// not needed by the task engine (e.g. glob/enumeration-only options):
/// those pass through via `options.extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub connection: ConnectionSpec,
    pub target: TargetSpec,
    pub source: SourceSpec,
    #[serde(default)]
    pub options: LoadOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// `file`, `s3`, or `hdfs` (see `crate::source::SourceDriver`).
    pub scheme: String,
    /// Bucket/container name; empty for the `file` scheme.
    #[serde(default)]
    pub container: String,
    /// A glob-style pattern identifying one or more objects.
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    /// When set, a prior successful task with the same `file_id` in the
    /// same (host, port, db, table) scope triggers a delete-before-reload
    /// against this column (see `SPEC_FULL.md` §4.G step 6).
    #[serde(default)]
    pub file_id_column: Option<String>,
    /// Shell command the downloaded bytes are piped through before
    /// reaching the loader (see `SPEC_FULL.md` §4.E step 6).
    #[serde(default)]
    pub script: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    pub fn has_file_id_column(&self) -> bool {
        self.spec.options.file_id_column.is_some()
    }

    /// 64-bit stable identifier for a source object, derived from its
    /// container and name. Mirrors `Jobs.hash_64_bit` (SHA-256, first 16
    /// hex chars), but is stored and compared as decimal text (see
    /// `SPEC_FULL.md` Open Question #4) to match the original's `TEXT`
    /// column type exactly rather than a native integer column.
    pub fn file_id(container: &str, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(container.as_bytes());
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let hex_prefix = hex::encode(&digest[..8]);
        let value = u64::from_str_radix(&hex_prefix, 16).expect("16 hex chars fit in u64");
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_is_deterministic() {
        let a = Job::file_id("bucket", "path/to/file.csv");
        let b = Job::file_id("bucket", "path/to/file.csv");
        assert_eq!(a, b);
    }

    #[test]
    fn file_id_differs_for_different_names() {
        let a = Job::file_id("bucket", "a.csv");
        let b = Job::file_id("bucket", "b.csv");
        assert_ne!(a, b);
    }

    #[test]
    fn file_id_is_decimal_text() {
        let id = Job::file_id("bucket", "a.csv");
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }
}
