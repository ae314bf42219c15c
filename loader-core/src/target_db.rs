/// The target database connection contract.
///
/// Grounded in `memsql_loader/db/pool.py`, `db/connection_wrapper.py`,
/// `db/load_data.py`, and `util/db_utils.py::try_kill_connection`. The
/// original pools MemSQL/MySQL connections behind a `ConnectionWrapper`;
/// here each loader thread owns exactly one non-pooled `sqlx` connection
/// for the lifetime of a single task, which is the pattern the original
/// actually uses for the bulk-load connection itself (pooling there is
/// for the *control* connections, not the load connection).
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor};
use thiserror::Error;

use crate::models::job::ConnectionSpec;

#[derive(Debug, Error)]
pub enum TargetDbError {
    #[error("connection error: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("query error: {0}")]
    Query(#[source] sqlx::Error),
}

impl TargetDbError {
    /// Whether this failure belongs to the connection-error class (reset,
    /// broken pipe, pool exhaustion, a dropped connection mid-query) rather
    /// than a permanent statement-level error (bad SQL, constraint
    /// violation, missing table). Mirrors `db_utils.py`'s distinction
    /// between errors that justify a requeue and ones that terminate the
    /// task as `error` (`SPEC_FULL.md` §4.F step 4, §7).
    pub fn is_connection_class(&self) -> bool {
        match self {
            TargetDbError::Connect(_) => true,
            TargetDbError::Query(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ),
        }
    }
}

/// Builds a `LOAD DATA` statement against a named pipe, matching the
/// clause ordering `db/load_data.py` emits.
pub struct LoadDataStmt {
    pub pipe_path: String,
    pub database: String,
    pub table: String,
    pub compressed: bool,
}

impl LoadDataStmt {
    pub fn to_sql(&self) -> String {
        let compression = if self.compressed { " COMPRESSION GZIP" } else { "" };
        format!(
            "LOAD DATA LOCAL INFILE '{}' INTO TABLE `{}`.`{}`{}",
            self.pipe_path, self.database, self.table, compression
        )
    }
}

#[async_trait]
pub trait TargetConnection: Send {
    /// The backend's connection id, used to `KILL` a stuck load from
    /// another connection (see `try_kill_connection`).
    async fn connection_id(&mut self) -> Result<u64, TargetDbError>;

    /// Opens the transaction the delete-before-reload and the bulk-load
    /// statement both run inside (`SPEC_FULL.md` §4.F step 2, §4.G step 4).
    async fn begin(&mut self) -> Result<(), TargetDbError>;

    async fn commit(&mut self) -> Result<(), TargetDbError>;

    /// Best-effort; called on any failure path that doesn't already kill
    /// the connection outright (which rolls back implicitly on its own).
    async fn rollback(&mut self) -> Result<(), TargetDbError>;

    /// Deletes rows matching `column = file_id`, used to make a reload of
    /// an already-loaded file idempotent (`SPEC_FULL.md` §4.G step 6).
    /// Runs inside the same transaction as `exec_load`.
    async fn delete_by_file_id(
        &mut self,
        database: &str,
        table: &str,
        column: &str,
        file_id: &str,
    ) -> Result<u64, TargetDbError>;

    async fn exec_load(&mut self, stmt: &LoadDataStmt) -> Result<u64, TargetDbError>;

    /// Issues `KILL <connection_id>` from a fresh, independent connection,
    /// mirroring the original's defensive "kill any connection the task
    /// might still be holding open before acquiring a new one" step (see
    /// `SPEC_FULL.md` §4.G step 2).
    async fn kill(spec: &ConnectionSpec, connection_id: u64) -> Result<(), TargetDbError>
    where
        Self: Sized;
}

pub struct MySqlTargetConnection {
    conn: MySqlConnection,
}

impl MySqlTargetConnection {
    pub async fn connect(spec: &ConnectionSpec) -> Result<Self, TargetDbError> {
        let options = MySqlConnectOptions::new()
            .host(&spec.host)
            .port(spec.port)
            .username(&spec.user)
            .password(&spec.password);
        let conn = MySqlConnection::connect_with(&options).await.map_err(TargetDbError::Connect)?;
        Ok(MySqlTargetConnection { conn })
    }
}

#[async_trait]
impl TargetConnection for MySqlTargetConnection {
    async fn connection_id(&mut self) -> Result<u64, TargetDbError> {
        let row: (u64,) = sqlx::query_as("SELECT CONNECTION_ID()")
            .fetch_one(&mut self.conn)
            .await
            .map_err(TargetDbError::Query)?;
        Ok(row.0)
    }

    async fn begin(&mut self) -> Result<(), TargetDbError> {
        self.conn.execute("BEGIN").await.map_err(TargetDbError::Query)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TargetDbError> {
        self.conn.execute("COMMIT").await.map_err(TargetDbError::Query)?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TargetDbError> {
        self.conn.execute("ROLLBACK").await.map_err(TargetDbError::Query)?;
        Ok(())
    }

    async fn delete_by_file_id(
        &mut self,
        database: &str,
        table: &str,
        column: &str,
        file_id: &str,
    ) -> Result<u64, TargetDbError> {
        let sql = format!("DELETE FROM `{database}`.`{table}` WHERE `{column}` = ?");
        let result = sqlx::query(&sql)
            .bind(file_id)
            .execute(&mut self.conn)
            .await
            .map_err(TargetDbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn exec_load(&mut self, stmt: &LoadDataStmt) -> Result<u64, TargetDbError> {
        let result = self.conn.execute(stmt.to_sql().as_str()).await.map_err(TargetDbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn kill(spec: &ConnectionSpec, connection_id: u64) -> Result<(), TargetDbError> {
        let mut killer = Self::connect(spec).await?;
        killer
            .conn
            .execute(format!("KILL {}", connection_id).as_str())
            .await
            .map_err(TargetDbError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_data_statement_includes_compression_clause_when_gzip() {
        let stmt = LoadDataStmt {
            pipe_path: "/tmp/x/data.gz".into(),
            database: "analytics".into(),
            table: "events".into(),
            compressed: true,
        };
        let sql = stmt.to_sql();
        assert!(sql.contains("COMPRESSION GZIP"));
        assert!(sql.contains("`analytics`.`events`"));
    }

    #[test]
    fn load_data_statement_omits_compression_clause_when_plain() {
        let stmt = LoadDataStmt {
            pipe_path: "/tmp/x/data".into(),
            database: "analytics".into(),
            table: "events".into(),
            compressed: false,
        };
        assert!(!stmt.to_sql().contains("COMPRESSION"));
    }
}
