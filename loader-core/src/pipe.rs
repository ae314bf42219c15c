/// A named pipe connecting the downloader (writer) to the loader (reader).
///
/// Grounded in `memsql_loader/util/fifo.py`: a `mkfifo` in a fresh temp
/// directory, optionally named with a `.gz` suffix, a writer-side open that
/// blocks until a reader attaches (so the writer can never race ahead of a
/// reader that hasn't shown up yet and silently drop bytes), and an
/// abort/detach protocol so either side can unblock or interrupt the other.
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct Pipe {
    dir: PathBuf,
    path: PathBuf,
    abort_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
    cleaned_up: AtomicBool,
}

impl Pipe {
    /// Creates the backing temp directory and FIFO. `gzip` appends a `.gz`
    /// suffix to the pipe's filename so the target database's bulk-load
    /// statement knows to decompress the stream itself (see
    /// `SPEC_FULL.md` §4.E).
    pub fn new(gzip: bool) -> io::Result<Self> {
        let dir = std::env::temp_dir().join(format!("memsql-loader-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        // original chmods the dir 0777 so a loader connection running as a
        // different OS user (e.g. the database server process) can read it
        std::fs::set_permissions(&dir, std::os::unix::fs::PermissionsExt::from_mode(0o777))?;

        let name = if gzip { "data.gz" } else { "data" };
        let path = dir.join(name);

        let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Pipe {
            dir,
            path,
            abort_hook: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers the callback invoked by `abort_reader()`. Mirrors
    /// `FIFO.attach_reader`: there is exactly one abort hook, set by
    /// whichever side (loader) needs to be told the other side died.
    pub fn attach_reader(&self, on_abort: impl Fn() + Send + 'static) {
        *self.abort_hook.lock().expect("abort hook mutex poisoned") = Some(Box::new(on_abort));
    }

    /// Clears the abort hook and unblocks a writer that might still be
    /// waiting for a reader by performing a quick non-blocking
    /// open-then-close of the read end.
    pub fn detach_reader(&self) {
        *self.abort_hook.lock().expect("abort hook mutex poisoned") = None;
        let _ = self.open_nonblocking_read_then_close();
    }

    fn open_nonblocking_read_then_close(&self) -> io::Result<()> {
        let c_path = CString::new(self.path.as_os_str().as_encoded_bytes()).unwrap();
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::close(fd) };
        Ok(())
    }

    /// Invokes the registered abort hook, if any, exactly once per call.
    /// Returns whether a hook was present and invoked.
    pub fn abort_reader(&self) -> bool {
        let hook = self.abort_hook.lock().expect("abort hook mutex poisoned").take();
        match hook {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    /// Opens the write end, blocking until a reader attaches. Polls for
    /// `should_abort()` every 100ms so callers can interrupt a writer
    /// stuck waiting for a reader that will never come (e.g. the worker is
    /// shutting down). On any error, invokes the abort hook, mirroring the
    /// original's `open()` context manager.
    pub fn open_writer(&self, should_abort: impl Fn() -> bool) -> io::Result<File> {
        let c_path = CString::new(self.path.as_os_str().as_encoded_bytes()).unwrap();
        loop {
            if should_abort() {
                self.abort_reader();
                return Err(io::Error::new(io::ErrorKind::Interrupted, "aborted while waiting for reader"));
            }

            let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
            if fd >= 0 {
                // Drop O_NONBLOCK now that a reader is attached so
                // subsequent writes block normally (or use our own
                // writability-wait helper, see `crate::source`).
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
                return Ok(unsafe { File::from_raw_fd(fd) });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENXIO) {
                self.abort_reader();
                return Err(err);
            }

            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// Blocking open of the read end; pairs with `open_writer`.
    pub fn open_reader(&self) -> io::Result<File> {
        std::fs::OpenOptions::new().read(true).open(&self.path)
    }

    /// Removes the FIFO and its temp directory. Safe to call more than
    /// once.
    pub fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Arc;

    #[test]
    fn mkfifo_creates_a_fifo_not_a_regular_file() {
        let pipe = Pipe::new(false).unwrap();
        let meta = std::fs::metadata(pipe.path()).unwrap();
        assert!(std::os::unix::fs::FileTypeExt::is_fifo(&meta.file_type()));
    }

    #[test]
    fn gzip_suffix_is_applied_to_filename() {
        let pipe = Pipe::new(true).unwrap();
        assert!(pipe.path().to_string_lossy().ends_with(".gz"));
    }

    #[test]
    fn writer_blocks_until_reader_attaches_then_round_trips_bytes() {
        let pipe = Arc::new(Pipe::new(false).unwrap());
        let reader_pipe = pipe.clone();

        let reader = std::thread::spawn(move || {
            let mut f = reader_pipe.open_reader().unwrap();
            let mut buf = Vec::new();
            f.read_to_end(&mut buf).unwrap();
            buf
        });

        // give the reader thread a moment to block in open()
        std::thread::sleep(Duration::from_millis(50));

        let mut writer = pipe.open_writer(|| false).unwrap();
        writer.write_all(b"hello").unwrap();
        drop(writer);

        let received = reader.join().unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn cleanup_is_idempotent() {
        let pipe = Pipe::new(false).unwrap();
        pipe.cleanup();
        pipe.cleanup();
        assert!(!pipe.path().exists());
    }

    #[test]
    fn abort_reader_invokes_hook_once() {
        let pipe = Pipe::new(false).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        pipe.attach_reader(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pipe.abort_reader());
        assert!(!pipe.abort_reader());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
