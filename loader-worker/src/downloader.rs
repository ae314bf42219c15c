/// The downloader thread: streams one source object into the pipe.
///
/// Grounded in `memsql_loader/execution/downloader.py`. Runs on a plain
/// `std::thread` (not async) because the underlying transfer is blocking
/// I/O; cancellation is a polled `AtomicBool` rather than a future, matching
/// the "progress callback returns non-zero to abort" shape of the original.
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flate2::write::GzDecoder;
use loader_core::config;
use loader_core::models::Job;
use loader_core::pipe::Pipe;
use loader_core::source::{self, SourceObject};

use crate::error::DownloadError;
use crate::metrics::DownloadMetrics;

pub struct DownloadOutcome {
    pub bytes_downloaded: u64,
    pub row_count_hint: Option<u64>,
}

/// Shared cancellation flag: set by the worker's polling loop when the
/// process is exiting or the lease has been lost.
pub type ShouldExit = Arc<AtomicBool>;

pub fn run(
    job: &Job,
    object: &SourceObject,
    pipe: Arc<Pipe>,
    metrics: Arc<Mutex<DownloadMetrics>>,
    should_exit: ShouldExit,
) -> Result<DownloadOutcome, DownloadError> {
    let driver = source::driver_for(&job.spec.source.scheme).map_err(|e| DownloadError::Worker(e.to_string()))?;
    let mut reader = driver.open(job, object).map_err(|e| DownloadError::Worker(e.to_string()))?;

    let should_exit_for_open = should_exit.clone();
    let pipe_writer = pipe
        .open_writer(move || should_exit_for_open.load(Ordering::SeqCst))
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::Interrupted {
                DownloadError::Requeue
            } else {
                DownloadError::Connection(e.to_string())
            }
        })?;

    let wants_gunzip = object.name.ends_with(".gz") && job.spec.options.script.is_some();

    // Optional script filter: fetch -> [gunzip] -> script stdin, script
    // stdout -> pipe (SPEC_FULL.md §4.E step 6). Without a script the fetch
    // writes straight to the pipe.
    let mut script_child = match job.spec.options.script.as_deref() {
        Some(script) => Some(spawn_script_filter(script)?),
        None => None,
    };

    let copy_handle = script_child.as_mut().map(|child| {
        let mut child_stdout = child.stdout.take().expect("script child stdout was piped");
        let mut pipe_writer = pipe_writer.try_clone().expect("pipe writer fd is dup-able");
        let should_exit = should_exit.clone();
        std::thread::spawn(move || -> Result<(), DownloadError> {
            let mut buf = [0u8; 64 * 1024];
            loop {
                if should_exit.load(Ordering::SeqCst) {
                    return Err(DownloadError::Requeue);
                }
                let n = child_stdout.read(&mut buf).map_err(|e| DownloadError::Worker(e.to_string()))?;
                if n == 0 {
                    return Ok(());
                }
                write_with_stall_check(&mut pipe_writer, &buf[..n], &should_exit)?;
            }
        })
    });

    let terminal_writer: Box<dyn Write + Send> = match script_child.as_mut() {
        Some(child) => Box::new(child.stdin.take().expect("script child stdin was piped")),
        None => Box::new(pipe_writer),
    };
    let mut sink = if wants_gunzip {
        OutputSink::Gzip(GzDecoder::new(terminal_writer))
    } else {
        OutputSink::Plain(terminal_writer)
    };

    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    let mut fetch_err: Option<DownloadError> = None;

    loop {
        if should_exit.load(Ordering::SeqCst) {
            fetch_err = Some(DownloadError::Requeue);
            break;
        }

        let stalled = metrics.lock().expect("metrics mutex poisoned").seconds_since_last_change() > config::DOWNLOAD_TIMEOUT;
        if stalled {
            fetch_err = Some(DownloadError::Connection("download stalled".into()));
            break;
        }

        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                fetch_err = Some(DownloadError::Connection(e.to_string()));
                break;
            }
        };
        if n == 0 {
            break;
        }

        if let Err(e) = sink.write_all(&buf[..n]) {
            fetch_err = Some(e);
            break;
        }

        total += n as u64;
        metrics.lock().expect("metrics mutex poisoned").record(total);
    }

    if fetch_err.is_none() {
        if let Err(e) = sink.finish() {
            fetch_err = Some(e);
        }
    }
    drop(sink);

    if let Some(mut child) = script_child {
        drop(child.stdin.take());
        if fetch_err.is_none() {
            if let Err(e) = wait_for_script_exit(&mut child) {
                fetch_err = Some(e);
            }
        } else {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    if let Some(handle) = copy_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => fetch_err = fetch_err.or(Some(e)),
            Err(_) => fetch_err = fetch_err.or(Some(DownloadError::Worker("script copy thread panicked".into()))),
        }
    }

    if let Some(e) = fetch_err {
        pipe.abort_reader();
        return Err(e);
    }

    Ok(DownloadOutcome { bytes_downloaded: total, row_count_hint: None })
}

/// Unifies the plain and gzip-decompressing write paths so the fetch loop
/// doesn't need to branch on whether decompression is active.
enum OutputSink {
    Plain(Box<dyn Write + Send>),
    Gzip(GzDecoder<Box<dyn Write + Send>>),
}

impl OutputSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), DownloadError> {
        let result = match self {
            OutputSink::Plain(w) => w.write_all(buf),
            OutputSink::Gzip(gz) => gz.write_all(buf),
        };
        result.map_err(|e| DownloadError::Worker(e.to_string()))
    }

    fn finish(&mut self) -> Result<(), DownloadError> {
        if let OutputSink::Gzip(gz) = self {
            gz.flush().map_err(|e| DownloadError::Worker(e.to_string()))?;
        }
        Ok(())
    }
}

/// Writes `chunk` to the pipe, bailing out if the cancellation flag flips
/// mid-write rather than blocking indefinitely on a full pipe buffer whose
/// reader has died.
fn write_with_stall_check(writer: &mut std::fs::File, chunk: &[u8], should_exit: &ShouldExit) -> Result<(), DownloadError> {
    if should_exit.load(Ordering::SeqCst) {
        return Err(DownloadError::Requeue);
    }
    writer.write_all(chunk).map_err(|e| DownloadError::Connection(e.to_string()))
}

/// Spawns an optional `/bin/sh -c <script>` filter between the fetch and
/// the pipe writer, verifying it stays alive for 1s before streaming.
pub fn spawn_script_filter(script: &str) -> Result<std::process::Child, DownloadError> {
    let mut child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| DownloadError::Worker(format!("failed to spawn script filter: {e}")))?;

    std::thread::sleep(Duration::from_secs(1));
    if let Ok(Some(status)) = child.try_wait() {
        return Err(DownloadError::Worker(format!("script filter exited immediately with {status}")));
    }
    Ok(child)
}

/// Waits up to `SCRIPT_EXIT_TIMEOUT` after stdin is closed, then kills the
/// process if it hasn't exited.
pub fn wait_for_script_exit(child: &mut std::process::Child) -> Result<(), DownloadError> {
    let deadline = std::time::Instant::now() + config::SCRIPT_EXIT_TIMEOUT;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            if status.success() {
                return Ok(());
            }
            return Err(DownloadError::Worker(format!("script filter exited with {status}")));
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            return Err(DownloadError::Worker("script filter did not exit within timeout".into()));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
