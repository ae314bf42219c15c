/// Record types for the embedded store.
///
/// Replaces the teacher's dynamic-attribute row objects with explicit
/// structs; derived columns (task/job state) become computed functions
/// rather than properties materialised by the ORM.
pub mod job;
pub mod task;

pub use job::{ConnectionSpec, Job, JobSpec, LoadOptions, SourceSpec, TargetSpec};
pub use task::{DerivedState, Step, Task, TaskState};
