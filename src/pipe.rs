//! The pipe streamer: anonymous pipe creation plus the concurrent worker
//! that copies a payload into the write end while the dispatcher keeps
//! serving requests.

use std::{
    fs::File,
    io::{self, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    thread::{self, JoinHandle},
};

use crate::error::PayloadError;

/// Creates an anonymous unidirectional pipe: `(read_end, write_end)`.
pub fn raw_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() just populated both descriptors; neither is owned
    // elsewhere.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn dup(fd: &OwnedFd) -> io::Result<OwnedFd> {
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: dup() returns a fresh, uniquely-owned descriptor on success.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// A payload transfer: given the write end of a pipe, stream a payload into
/// it and report a terminal error, if any. Handlers build one of these per
/// `GetManifest`/`GetBlob` call; what it does (plain copy vs. tee-and-verify)
/// is entirely up to the handler.
pub type Transfer = Box<dyn FnOnce(&mut dyn Write) -> Result<(), PayloadError> + Send>;

/// One outstanding payload transfer. Holds the pipe's write end and the
/// worker's join handle; the worker is not joined, and the write end is not
/// closed, until [`PipeRecord::finish`] is called.
pub struct PipeRecord {
    write_end: OwnedFd,
    worker: Option<JoinHandle<Result<(), PayloadError>>>,
}
impl PipeRecord {
    /// Creates a fresh pipe and spawns a worker that runs `transfer` against
    /// a *duplicate* of the write end. Returns the read end (to be handed to
    /// the parent) and the record (to be placed in the pipe table under a
    /// fresh id).
    ///
    /// Structured so that any failure between pipe creation and the worker
    /// actually starting closes both ends rather than leaking one: the
    /// duplicate used by the worker is created before the thread is spawned,
    /// and propagating an error here drops every `OwnedFd` created so far.
    pub fn spawn(transfer: Transfer) -> io::Result<(OwnedFd, Self)> {
        let (read_end, write_end) = raw_pipe()?;
        let worker_write = dup(&write_end)?;
        let worker = thread::spawn(move || {
            let mut writer = File::from(worker_write);
            let result = transfer(&mut writer);
            // The worker's own fd closes here regardless of outcome; the
            // pipe stays open to the parent because `write_end` above is
            // still held by the `PipeRecord`.
            result
        });
        Ok((read_end, Self { write_end, worker: Some(worker) }))
    }

    /// Waits for the worker, closes the write end, and returns the worker's
    /// terminal error, if any. This is the only place payload errors surface
    /// (short writes, size/digest mismatches): the handler that allocated
    /// the pipe never sees them.
    pub fn finish(mut self) -> Result<(), PayloadError> {
        let worker = self.worker.take().expect("PipeRecord::finish called more than once");
        let result = worker
            .join()
            .unwrap_or_else(|_| Err(PayloadError::Io("streamer thread panicked".to_owned())));
        // `self.write_end` closes here as `self` drops, after the join.
        result
    }
}
