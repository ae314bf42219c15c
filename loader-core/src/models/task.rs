/// The `Task` record and its derived state.
///
/// Grounded in `memsql_loader/api/shared.py` (`TaskState`, the
/// derived-state SQL `CASE` projection) and
/// `memsql_loader/util/apsw_sql_step_queue/task_handler.py` (durable
/// fields, `steps`).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Terminal or in-flight state of a task, derived from its durable columns.
///
/// `Cancelled` surfaces distinctly from `Finished`/`Success` because
/// `bulk_finish` writes `result = "cancelled"` and the projection upper-cases
/// `result` for any row with `finished IS NOT NULL` (see Open Question #3 in
/// `SPEC_FULL.md`) rather than collapsing every terminal row to one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Success => "SUCCESS",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error | TaskState::Cancelled)
    }

    /// Parses the `result` column's value into a terminal state. Panics on
    /// an unrecognised value: the store only ever writes `success`,
    /// `error`, or `cancelled` into `result`.
    fn from_result(result: &str) -> TaskState {
        match result.to_ascii_uppercase().as_str() {
            "SUCCESS" => TaskState::Success,
            "ERROR" => TaskState::Error,
            "CANCELLED" => TaskState::Cancelled,
            other => panic!("unrecognised task result '{other}'"),
        }
    }
}

/// A single named sub-phase of a task's execution (e.g. `download`).
///
/// A task may only `finish()` or `requeue()` once every step it started has
/// also been stopped (`QueueError::StepRunning`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl Step {
    pub fn is_running(&self) -> bool {
        self.stop.is_none()
    }
}

/// One file-to-load unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub job_id: String,
    pub created: DateTime<Utc>,
    pub data: JsonValue,
    pub file_id: String,
    pub md5: Option<String>,
    pub bytes_total: Option<i64>,
    pub bytes_downloaded: Option<i64>,
    pub download_rate: Option<f64>,
    pub execution_id: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub last_contact: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub steps: Vec<Step>,
    pub update_count: i64,
}

impl Task {
    /// True while at least one step has been started but not stopped.
    pub fn has_running_step(&self) -> bool {
        self.steps.iter().any(Step::is_running)
    }

    /// Computes the derived state from durable fields alone (no SQL),
    /// exactly mirroring the `CASE` projection the store runs. Used both by
    /// callers that already hold a `Task` and by the equivalence test
    /// required by `SPEC_FULL.md` Testable Property #6.
    pub fn derived_state(&self, now: DateTime<Utc>, lease_ttl: chrono::Duration) -> TaskState {
        DerivedState::from_row(
            self.finished,
            self.result.as_deref(),
            self.execution_id.as_deref(),
            self.last_contact,
            now,
            lease_ttl,
        )
    }
}

/// Standalone evaluator used to assert the SQL projection and the
/// `Task::derived_state` method agree (Testable Property #6).
pub struct DerivedState;

impl DerivedState {
    pub fn from_row(
        finished: Option<DateTime<Utc>>,
        result: Option<&str>,
        execution_id: Option<&str>,
        last_contact: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lease_ttl: chrono::Duration,
    ) -> TaskState {
        if let (Some(_), Some(result)) = (finished, result) {
            return TaskState::from_result(result);
        }
        if finished.is_some() {
            return TaskState::Cancelled;
        }
        let lease_expired = match last_contact {
            None => true,
            Some(last) => now - last > lease_ttl,
        };
        if execution_id.is_none() || lease_expired {
            TaskState::Queued
        } else {
            TaskState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn base_task() -> Task {
        Task {
            id: 1,
            job_id: "abc".into(),
            created: Utc::now(),
            data: serde_json::json!({}),
            file_id: "1".into(),
            md5: None,
            bytes_total: None,
            bytes_downloaded: None,
            download_rate: None,
            execution_id: None,
            started: None,
            last_contact: None,
            finished: None,
            result: None,
            steps: vec![],
            update_count: 0,
        }
    }

    #[test]
    fn queued_when_never_claimed() {
        let task = base_task();
        let now = Utc::now();
        assert_eq!(task.derived_state(now, ChronoDuration::seconds(120)), TaskState::Queued);
    }

    #[test]
    fn running_when_recently_pinged() {
        let mut task = base_task();
        let now = Utc::now();
        task.execution_id = Some("exec-1".into());
        task.last_contact = Some(now);
        assert_eq!(task.derived_state(now, ChronoDuration::seconds(120)), TaskState::Running);
    }

    #[test]
    fn queued_when_lease_expired() {
        let mut task = base_task();
        let now = Utc::now();
        task.execution_id = Some("exec-1".into());
        task.last_contact = Some(now - ChronoDuration::seconds(200));
        assert_eq!(task.derived_state(now, ChronoDuration::seconds(120)), TaskState::Queued);
    }

    #[test]
    fn cancelled_surfaces_distinctly_from_finished() {
        let mut task = base_task();
        let now = Utc::now();
        task.finished = Some(now);
        task.result = Some("cancelled".into());
        task.execution_id = Some("0".into());
        assert_eq!(task.derived_state(now, ChronoDuration::seconds(120)), TaskState::Cancelled);
    }

    #[test]
    fn row_evaluator_agrees_with_task_method() {
        let mut task = base_task();
        let now = Utc::now();
        task.execution_id = Some("exec-1".into());
        task.last_contact = Some(now - ChronoDuration::seconds(10));

        let via_task = task.derived_state(now, ChronoDuration::seconds(120));
        let via_row = DerivedState::from_row(
            task.finished,
            task.result.as_deref(),
            task.execution_id.as_deref(),
            task.last_contact,
            now,
            ChronoDuration::seconds(120),
        );
        assert_eq!(via_task, via_row);
    }
}
