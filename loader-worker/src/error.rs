/// Error taxonomy for a single worker's task attempt.
///
/// Grounded in `memsql_loader/execution/exceptions.py`: a small closed set
/// of kinds (`ConnectionException`, `WorkerException`, requeue) rather than
/// bare exceptions, so the worker's reconciliation step (`SPEC_FULL.md`
/// §4.G, §7) can match on the kind instead of string-sniffing a message.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download stalled or cancelled, requeue")]
    Requeue,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("worker error: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("worker error: {0}")]
    Worker(String),
}

/// What the worker's reconciliation step decided to do with a finished
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Commit,
    Requeue,
    Error,
    /// The lease was lost underneath us (bulk-cancel or TTL expiry); drop
    /// the attempt without touching the row.
    Dropped,
}

/// Applies the precedence table in `SPEC_FULL.md` §4.G step 9: a requeue
/// signal from either side wins outright; otherwise a non-worker error
/// outranks a worker error; ties fall back to whichever side reported
/// first.
pub fn reconcile(
    downloader: Option<&DownloadError>,
    loader: Option<&LoadError>,
) -> ReconcileOutcome {
    let downloader_requeues = matches!(downloader, Some(DownloadError::Requeue) | Some(DownloadError::Connection(_)));
    let loader_connection_error = matches!(loader, Some(LoadError::Connection(_)));

    if downloader_requeues || loader_connection_error {
        return ReconcileOutcome::Requeue;
    }
    if downloader.is_some() || loader.is_some() {
        return ReconcileOutcome::Error;
    }
    ReconcileOutcome::Commit
}

/// The message to write into `task.data.error` for an `Error` outcome.
/// Only ever consulted once `reconcile` has already ruled out a requeue, so
/// whatever is present here is a permanent (`WorkerException`-class)
/// failure; prefers the downloader's message when both sides report one,
/// matching `reconcile`'s own "earlier side wins" tie-break.
pub fn error_message(downloader: Option<&DownloadError>, loader: Option<&LoadError>) -> String {
    downloader
        .map(|e| e.to_string())
        .or_else(|| loader.map(|e| e.to_string()))
        .unwrap_or_else(|| "task failed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_signal_wins_over_a_worker_error_on_the_other_side() {
        let outcome = reconcile(Some(&DownloadError::Requeue), Some(&LoadError::Connection("x".into())));
        assert_eq!(outcome, ReconcileOutcome::Requeue);
    }

    #[test]
    fn two_worker_errors_still_error() {
        let outcome = reconcile(Some(&DownloadError::Worker("a".into())), Some(&LoadError::Connection("b".into())));
        assert_eq!(outcome, ReconcileOutcome::Requeue);
    }

    #[test]
    fn no_errors_commits() {
        assert_eq!(reconcile(None, None), ReconcileOutcome::Commit);
    }

    #[test]
    fn a_single_worker_error_is_an_error_outcome() {
        assert_eq!(reconcile(Some(&DownloadError::Worker("bad script exit".into())), None), ReconcileOutcome::Error);
    }
}
