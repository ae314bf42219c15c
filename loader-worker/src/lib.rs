//! The per-task execution pipeline run by each worker process: claim a
//! task, run its downloader and loader threads against a shared named
//! pipe, reconcile their outcomes, and report back to the store.
//!
//! ## Module organization
//!
//! - `worker`: the per-process main loop (`SPEC_FULL.md` §4.G)
//! - `downloader`: the source-to-pipe writer thread
//! - `bulk_load`: the pipe-to-target-db reader thread (`LOAD DATA LOCAL INFILE`)
//! - `metrics`: download-rate and stall tracking shared between the two threads
//! - `cleanup_lock`: the cross-process advisory lock guarding duplicate-row cleanup
//! - `error`: execution error types and downloader/loader outcome reconciliation

pub mod bulk_load;
pub mod cleanup_lock;
pub mod downloader;
pub mod error;
pub mod metrics;
pub mod worker;
