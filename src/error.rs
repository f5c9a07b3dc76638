//! Error handling for the orchestrator.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::health::HealthPayload;

/// Defines all possible errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration is well-formed YAML but semantically invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown service or cyclic dependency.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Another invocation held the service lock past the deadline.
    #[error("Timed out after {timeout:?} waiting for the lock on service '{service}'")]
    LockTimeout {
        /// The service whose lock could not be taken.
        service: String,
        /// How long the acquisition was retried.
        timeout: Duration,
    },

    /// The lock layer failed for a reason other than contention.
    #[error("Failed to lock service '{service}': {source}")]
    LockError {
        /// The service whose lock failed.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The launch settings point at a directory that does not exist.
    #[error("Working directory for service '{service}' does not exist: {}", .path.display())]
    MissingWorkingDirectory {
        /// The service being launched.
        service: String,
        /// The missing directory.
        path: PathBuf,
    },

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The worker died within the start grace period.
    #[error(
        "Service '{service}' failed to start or crashed immediately; see {}",
        .log_path.display()
    )]
    CrashedOnStart {
        /// The service that crashed.
        service: String,
        /// Log file holding the worker's output.
        log_path: PathBuf,
    },

    /// The service never reported healthy within its readiness timeout.
    #[error("Service '{service}' did not become healthy within {timeout:?}: {last_error}")]
    HealthTimeout {
        /// The service being awaited.
        service: String,
        /// The per-service readiness timeout.
        timeout: Duration,
        /// The final health observation, including the payload when one arrived.
        last_error: HealthError,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFileError(#[from] PidFileError),

    /// Error talking to the health endpoint outside of readiness polling.
    #[error("Health check failed: {0}")]
    Health(#[from] HealthError),
}

impl<T> From<std::sync::PoisonError<T>> for OrchestratorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        OrchestratorError::MutexPoisonError(err.to_string())
    }
}

/// Failures produced while ordering services.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A name that is not part of the service graph.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Dependency cycle detected while visiting the named service.
    #[error("Detected dependency cycle at service '{0}'")]
    Cycle(String),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or removing a PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but does not hold a decimal PID.
    #[error("PID file {} holds invalid content {content:?}", .path.display())]
    Parse {
        /// The offending file.
        path: PathBuf,
        /// What was found in it, whitespace-trimmed.
        content: String,
    },
}

/// Observations from the health endpoint that mean "not ready".
#[derive(Debug, Error)]
pub enum HealthError {
    /// The request never produced a response.
    #[error("health endpoint unreachable: {0}")]
    Transport(String),

    /// A 2xx response whose body is not a health payload.
    #[error("malformed health payload: {0}")]
    Malformed(String),

    /// Non-2xx response or an unhealthy overall status.
    #[error("health endpoint reported '{status}' (HTTP {status_code})")]
    Unhealthy {
        /// HTTP status code of the response.
        status_code: u16,
        /// Top-level status string, or the HTTP reason when the body was unreadable.
        status: String,
        /// Payload, when the body parsed.
        payload: Option<Box<HealthPayload>>,
    },

    /// The payload arrived but the service's component is not healthy.
    #[error("component '{component}' is {status}")]
    ComponentUnhealthy {
        /// Health component identifier.
        component: String,
        /// Its reported status, or `missing` when absent.
        status: String,
        /// Full payload for diagnosis.
        payload: Box<HealthPayload>,
    },
}

impl HealthError {
    /// Returns the payload attached to this observation, if any.
    pub fn payload(&self) -> Option<&HealthPayload> {
        match self {
            HealthError::Unhealthy { payload, .. } => payload.as_deref(),
            HealthError::ComponentUnhealthy { payload, .. } => Some(payload),
            HealthError::Transport(_) | HealthError::Malformed(_) => None,
        }
    }
}
