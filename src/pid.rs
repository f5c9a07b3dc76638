//! PID registry: one `<state>/pids/<service>.pid` file per service.
//!
//! Workers write their own PID file once they have initialised. This module
//! only reads and clears entries; it never decides liveness on its own.
use std::{fs, io, path::PathBuf};

use tracing::{debug, info};

use crate::{error::PidFileError, liveness::LivenessProbe, runtime::RuntimePaths};

/// Outcome of checking a registry entry against the liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// No PID file present.
    Absent,
    /// PID file names a live process.
    Live(u32),
    /// PID file named a dead process and has been removed.
    ClearedStale(u32),
}

/// Reads and clears per-service PID files.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    paths: RuntimePaths,
}

impl PidRegistry {
    pub fn new(paths: RuntimePaths) -> Self {
        Self { paths }
    }

    /// Path of the PID file for `service`.
    pub fn path(&self, service: &str) -> PathBuf {
        self.paths.pid_file(service)
    }

    /// Returns the recorded PID, or `None` when the service has no entry.
    ///
    /// Surrounding whitespace is tolerated; anything else is a parse error.
    pub fn read(&self, service: &str) -> Result<Option<u32>, PidFileError> {
        let path = self.path(service);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let trimmed = contents.trim();
        trimmed
            .parse::<u32>()
            .map(Some)
            .map_err(|_| PidFileError::Parse {
                path,
                content: trimmed.to_string(),
            })
    }

    /// Removes the entry for `service`. A missing file is not an error.
    pub fn remove(&self, service: &str) -> Result<(), PidFileError> {
        match fs::remove_file(self.path(service)) {
            Ok(()) => {
                debug!("Removed PID file for '{service}'");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the PID only when the entry names a live process.
    pub fn live_pid(
        &self,
        service: &str,
        probe: &dyn LivenessProbe,
    ) -> Result<Option<u32>, PidFileError> {
        Ok(self.read(service)?.filter(|pid| probe.is_alive(*pid)))
    }

    /// Checks the entry for `service`, deleting it when the process is gone.
    ///
    /// A PID file with unparseable content is treated like a stale one.
    pub fn clear_stale(
        &self,
        service: &str,
        probe: &dyn LivenessProbe,
    ) -> Result<RegistryState, PidFileError> {
        match self.read(service) {
            Ok(None) => Ok(RegistryState::Absent),
            Ok(Some(pid)) if probe.is_alive(pid) => Ok(RegistryState::Live(pid)),
            Ok(Some(pid)) => {
                info!("Removing stale PID file for '{service}' (PID {pid} is not running)");
                self.remove(service)?;
                Ok(RegistryState::ClearedStale(pid))
            }
            Err(PidFileError::Parse { content, .. }) => {
                info!("Removing unreadable PID file for '{service}' ({content:?})");
                self.remove(service)?;
                Ok(RegistryState::Absent)
            }
            Err(err) => Err(err),
        }
    }
}
