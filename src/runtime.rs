//! Runtime paths for PID, lock, and log files.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use crate::constants::{
    DEFAULT_STATE_SUBDIR, LOCK_FILE_EXTENSION, LOG_DIR_NAME, LOG_FILE_EXTENSION,
    PID_DIR_NAME, PID_FILE_EXTENSION, STATE_DIR_ENV,
};

/// Layout of the state directory shared by every invocation.
///
/// ```text
/// <state>/pids/<service>.pid
/// <state>/pids/<service>.lock
/// <state>/logs/<service>.log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    state_dir: PathBuf,
}

impl RuntimePaths {
    /// Roots the layout at an explicit directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Resolves the state dir from `ORCH_DATA_DIR`, falling back to
    /// `$HOME/.local/share/orchestrator`.
    pub fn from_env() -> Self {
        if let Some(dir) = env::var_os(STATE_DIR_ENV).filter(|value| !value.is_empty()) {
            return Self::new(dir);
        }

        let home = env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(DEFAULT_STATE_SUBDIR))
    }

    /// Root of the layout.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Directory holding PID and lock files.
    pub fn pid_dir(&self) -> PathBuf {
        self.state_dir.join(PID_DIR_NAME)
    }

    /// Directory holding service logs.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join(LOG_DIR_NAME)
    }

    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.pid_dir()
            .join(format!("{service}.{PID_FILE_EXTENSION}"))
    }

    pub fn lock_file(&self, service: &str) -> PathBuf {
        self.pid_dir()
            .join(format!("{service}.{LOCK_FILE_EXTENSION}"))
    }

    pub fn log_file(&self, service: &str) -> PathBuf {
        self.log_dir()
            .join(format!("{service}.{LOG_FILE_EXTENSION}"))
    }

    /// Creates the PID and log directories if they are missing.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.pid_dir())?;
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
