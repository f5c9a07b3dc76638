//! Constants and default values for the orchestrator.
//!
//! Every timing and sizing knob used by the supervision path lives here so the
//! bounded waits are easy to audit in one place.

use std::time::Duration;

// ============================================================================
// File System Layout
// ============================================================================

/// Directory under the state dir holding PID and lock files.
pub const PID_DIR_NAME: &str = "pids";

/// Directory under the state dir holding per-service log files.
pub const LOG_DIR_NAME: &str = "logs";

/// Extension of the per-service PID file written by the worker.
pub const PID_FILE_EXTENSION: &str = "pid";

/// Extension of the per-service advisory lock target.
pub const LOCK_FILE_EXTENSION: &str = "lock";

/// Extension of the per-service append-only log file.
pub const LOG_FILE_EXTENSION: &str = "log";

/// State directory relative to `$HOME` when nothing overrides it.
pub const DEFAULT_STATE_SUBDIR: &str = ".local/share/orchestrator";

// ============================================================================
// Environment Variables
// ============================================================================

/// Overrides the state directory; also exported to every worker.
pub const STATE_DIR_ENV: &str = "ORCH_DATA_DIR";

/// Overrides the health endpoint base URL.
pub const SERVER_URL_ENV: &str = "ORCH_SERVER_URL";

/// Exported to workers: the service name they run as.
pub const SERVICE_NAME_ENV: &str = "ORCH_SERVICE";

/// Exported to workers: where to write their PID once initialised.
pub const PID_FILE_ENV: &str = "ORCH_PID_FILE";

/// Ambient variables copied from the controller into every worker environment.
pub const ENV_ALLOWLIST: &[&str] = &[
    "HOME",
    "USER",
    "USERNAME",
    "LOGNAME",
    "USERPROFILE",
    "TMPDIR",
    "TEMP",
    "TMP",
    "PATH",
    "LANG",
    "SYSTEMROOT",
    STATE_DIR_ENV,
];

// ============================================================================
// Health Endpoint
// ============================================================================

/// Base URL of the aggregate health endpoint.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Path appended to the server URL for health checks.
pub const HEALTH_PATH: &str = "/health";

/// Component status string that counts as healthy (compared case-insensitively).
pub const HEALTHY_STATUS: &str = "healthy";

/// Request timeout for a single health round-trip.
pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness polls.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Readiness timeout applied when a service does not declare one.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Coordination Timing
// ============================================================================

/// Upper bound on waiting for another invocation to release a service lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between non-blocking lock attempts.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a worker to write its PID file.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between PID registry polls while awaiting registration.
pub const REGISTRATION_POLL_INTERVAL: Duration = Duration::from_millis(200);

// ============================================================================
// Process Management Timing
// ============================================================================

/// Delay after spawning before checking that the worker survived startup.
pub const START_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How long a worker gets to exit after the graceful signal.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between liveness checks while waiting for a worker to exit.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to keep checking after a force kill.
pub const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// How long the exit waiter gives the output readers to drain.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Logging and Output
// ============================================================================

/// Log writers flush after this many lines.
pub const LOG_FLUSH_EVERY_LINES: usize = 10;

/// Lines of log tail surfaced to the operator when a worker fails.
pub const CRASH_LOG_TAIL_LINES: usize = 20;

/// Default line count for `orch logs`.
pub const DEFAULT_LOG_LINES: usize = 50;

/// Timestamp format used in log line prefixes.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ============================================================================
// Built-in Services
// ============================================================================

/// Name of the API server every other service leans on.
pub const SERVER_SERVICE: &str = "server";

/// Name of the model runtime service.
pub const UNIVERSAL_RUNTIME_SERVICE: &str = "universal-runtime";

/// Name of the retrieval worker.
pub const RAG_SERVICE: &str = "rag";
