//! Orchestrator is a dependency-aware supervisor for a small set of local
//! worker services. It starts services in dependency order, waits for each to
//! register and report healthy, and stops them dependents-first, coordinating
//! concurrent invocations through per-service file locks and PID files.

/// CLI interface.
pub mod cli;

/// Configuration and the service graph.
pub mod config;

/// Shared constants.
pub mod constants;

/// Worker environment construction.
pub mod env;

/// Error handling.
pub mod error;

/// Aggregate health endpoint client.
pub mod health;

/// Process liveness probing.
pub mod liveness;

/// Per-service advisory locks.
pub mod lock;

/// Log capture and viewing.
pub mod logs;

/// Orchestration façade.
pub mod manager;

/// PID registry.
pub mod pid;

/// Process supervision.
pub mod process;

/// Dependency resolution.
pub mod resolver;

/// State directory layout.
pub mod runtime;

/// Process groups and termination signals.
pub mod signal;

#[doc(hidden)]
pub mod test_utils;
