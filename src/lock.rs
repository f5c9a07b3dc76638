//! Per-service advisory locks shared across invocations.
//!
//! The lock only makes "is it running? → launch → await registration" atomic
//! between concurrent invocations. It says nothing about the worker itself.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::{error::OrchestratorError, runtime::RuntimePaths};

/// An exclusive lock on `<state>/pids/<service>.lock`, released on drop.
#[derive(Debug)]
pub struct ServiceLock {
    service: String,
    path: PathBuf,
    file: Option<File>,
}

impl ServiceLock {
    /// Retries a non-blocking exclusive lock every `poll` until `timeout`
    /// elapses. Errors other than contention fail immediately.
    pub fn acquire(
        paths: &RuntimePaths,
        service: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Self, OrchestratorError> {
        let path = paths.lock_file(service);
        let file = open_lock_file(&path).map_err(|source| OrchestratorError::LockError {
            service: service.to_string(),
            source,
        })?;

        let deadline = Instant::now() + timeout;
        let mut contended = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired lock for '{service}' at {}", path.display());
                    return Ok(Self {
                        service: service.to_string(),
                        path,
                        file: Some(file),
                    });
                }
                Err(err) if is_contention(&err) => {
                    if !contended {
                        debug!("Lock for '{service}' is held elsewhere; waiting");
                        contended = true;
                    }
                }
                Err(source) => {
                    return Err(OrchestratorError::LockError {
                        service: service.to_string(),
                        source,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::LockTimeout {
                    service: service.to_string(),
                    timeout,
                });
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock. Releasing an already-released lock does nothing.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = FileExt::unlock(&file) {
                warn!("Failed to unlock '{}': {err}", self.service);
            } else {
                debug!("Released lock for '{}'", self.service);
            }
        }
    }
}

impl Drop for ServiceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Releases an optional lock handle; `None` is a no-op.
pub fn release(lock: Option<ServiceLock>) {
    if let Some(mut lock) = lock {
        lock.release();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contention(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
