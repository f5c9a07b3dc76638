//! Orchestration over the service graph: ensure services are running and
//! healthy, stop them with their dependents, and report status.
use std::{
    fmt::Write as _,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, error, info};

use crate::{
    config::{ServiceDefinition, ServiceGraph, Timings},
    env::worker_environment,
    error::{OrchestratorError, ResolveError},
    health::{HealthPayload, HealthSource},
    liveness::{LivenessProbe, SystemProbe},
    lock::{self, ServiceLock},
    pid::RegistryState,
    process::{LogCapture, ProcessStatus, ProcessSupervisor},
    resolver,
    runtime::RuntimePaths,
};

/// Point-in-time view of one service for `status` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReport {
    pub name: String,
    pub pid: Option<u32>,
    /// Status of the process this invocation launched, if any.
    pub process: Option<ProcessStatus>,
    /// Status string of the matching health component, if the endpoint answered.
    pub health: Option<String>,
    pub uptime: Option<Duration>,
    pub memory_bytes: Option<u64>,
}

/// Every service report plus the health error, when the endpoint could not
/// be read at all.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub services: Vec<ServiceReport>,
    pub health_error: Option<String>,
}

/// Composes the resolver, locks, supervisor and health checks.
pub struct ServiceManager {
    graph: ServiceGraph,
    paths: RuntimePaths,
    timings: Timings,
    supervisor: ProcessSupervisor,
    health: Box<dyn HealthSource>,
}

impl ServiceManager {
    pub fn new(
        graph: ServiceGraph,
        paths: RuntimePaths,
        timings: Timings,
        health: Box<dyn HealthSource>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_probe(graph, paths, timings, health, Arc::new(SystemProbe))
    }

    /// Like [`new`](Self::new) with an explicit liveness probe.
    pub fn with_probe(
        graph: ServiceGraph,
        paths: RuntimePaths,
        timings: Timings,
        health: Box<dyn HealthSource>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Result<Self, OrchestratorError> {
        graph.validate()?;
        let known = resolver::stop_order(&graph, &graph.names())?;
        let supervisor =
            ProcessSupervisor::new(paths.clone(), probe, timings).with_known_services(known);

        Ok(Self {
            graph,
            paths,
            timings,
            supervisor,
            health,
        })
    }

    /// Selects how launched workers have their output captured.
    pub fn with_log_capture(mut self, capture: LogCapture) -> Self {
        self.supervisor = self.supervisor.with_log_capture(capture);
        self
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Brings `names` and their dependencies up, in dependency order, and
    /// waits for each to report healthy before moving on.
    ///
    /// The first failure aborts the rest of the batch.
    pub fn ensure<S: AsRef<str>>(&self, names: &[S]) -> Result<(), OrchestratorError> {
        if names.is_empty() {
            return Ok(());
        }

        let order = resolver::resolve_many(&self.graph, names)?;
        info!("Ensuring services: {}", order.join(" -> "));

        for name in &order {
            let definition = self
                .graph
                .get(name)
                .ok_or_else(|| ResolveError::UnknownService(name.clone()))?;
            self.ensure_service(definition)?;
        }

        Ok(())
    }

    fn ensure_service(&self, definition: &ServiceDefinition) -> Result<(), OrchestratorError> {
        let name = &definition.name;
        match self.health.component_ready(&definition.health_component) {
            Ok(()) => {
                info!("Service '{name}' is already healthy");
                return Ok(());
            }
            Err(err) => debug!("Service '{name}' is not healthy yet: {err}"),
        }

        self.paths
            .ensure_dirs()
            .map_err(|source| OrchestratorError::ServiceStartError {
                service: name.clone(),
                source,
            })?;

        let lock = ServiceLock::acquire(
            &self.paths,
            name,
            self.timings.lock_timeout,
            self.timings.lock_poll,
        )?;
        let launched = self.launch_locked(definition);
        lock::release(Some(lock));
        launched?;

        self.wait_until_healthy(definition)
    }

    /// Re-checks the registry under the service lock and launches only when
    /// no live instance exists.
    fn launch_locked(&self, definition: &ServiceDefinition) -> Result<(), OrchestratorError> {
        let name = &definition.name;
        match self.supervisor.check_existing(name)? {
            RegistryState::Live(pid) => {
                info!("Service '{name}' is already running (PID {pid}); waiting for health");
                return Ok(());
            }
            RegistryState::ClearedStale(pid) => {
                debug!("Cleared stale registration of '{name}' (PID {pid})");
            }
            RegistryState::Absent => {}
        }

        let env = worker_environment(definition, &self.paths)?;
        self.supervisor.start(
            name,
            &definition.launch.workdir,
            &env,
            &definition.launch.command,
        )?;
        self.supervisor
            .wait_for_registration(name, self.timings.registration_timeout);
        Ok(())
    }

    /// Polls health until the component is ready, checking once more at the
    /// deadline before giving up with the last observation.
    fn wait_until_healthy(&self, definition: &ServiceDefinition) -> Result<(), OrchestratorError> {
        let name = &definition.name;
        let deadline = Instant::now() + definition.timeout;

        loop {
            match self.health.component_ready(&definition.health_component) {
                Ok(()) => {
                    info!("Service '{name}' is healthy");
                    return Ok(());
                }
                Err(err) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(OrchestratorError::HealthTimeout {
                            service: name.clone(),
                            timeout: definition.timeout,
                            last_error: err,
                        });
                    }
                    debug!("Waiting for '{name}' to become healthy: {err}");
                    thread::sleep(self.timings.health_poll.min(deadline - now));
                }
            }
        }
    }

    /// Stops `names` together with everything that depends on them,
    /// dependents first. Individual failures are logged and skipped.
    pub fn stop<S: AsRef<str>>(&self, names: &[S]) -> Result<(), OrchestratorError> {
        if names.is_empty() {
            return Ok(());
        }

        let order = resolver::stop_order(&self.graph, names)?;
        info!("Stopping services: {}", order.join(" -> "));

        for name in &order {
            if let Err(err) = self.supervisor.stop(name) {
                error!("Failed to stop service '{name}': {err}");
            }
        }

        Ok(())
    }

    /// Stops every graph service in reverse dependency order, then sweeps
    /// anything still tracked or registered.
    pub fn stop_all(&self) {
        if let Err(err) = self.stop(&self.graph.names()) {
            error!("Failed to order services for shutdown: {err}");
        }
        self.supervisor.stop_all();
    }

    /// Collects PID, health and resource usage for every service in the graph.
    pub fn status(&self) -> Result<StatusReport, OrchestratorError> {
        let (payload, health_error): (Option<HealthPayload>, Option<String>) =
            match self.health.fetch() {
                Ok(payload) => (Some(payload), None),
                Err(err) => {
                    debug!("Health endpoint unavailable for status: {err}");
                    (err.payload().cloned(), Some(err.to_string()))
                }
            };

        let mut reports = Vec::with_capacity(self.graph.len());
        for definition in self.graph.iter() {
            let name = &definition.name;
            reports.push(ServiceReport {
                name: name.clone(),
                pid: self.supervisor.running_pid(name)?,
                process: self.supervisor.record(name)?.map(|record| record.status()),
                health: payload
                    .as_ref()
                    .and_then(|payload| payload.component(&definition.health_component))
                    .map(|component| component.status.clone()),
                uptime: None,
                memory_bytes: None,
            });
        }

        sample_resources(&mut reports);
        Ok(StatusReport {
            services: reports,
            health_error,
        })
    }
}

fn sample_resources(reports: &mut [ServiceReport]) {
    let pids: Vec<Pid> = reports
        .iter()
        .filter_map(|report| report.pid)
        .map(Pid::from_u32)
        .collect();
    if pids.is_empty() {
        return;
    }

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&pids),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );

    for report in reports.iter_mut() {
        let Some(process) = report.pid.and_then(|pid| system.process(Pid::from_u32(pid))) else {
            continue;
        };
        report.uptime = Some(Duration::from_secs(process.run_time()));
        report.memory_bytes = Some(process.memory());
    }
}

/// Renders a status report as a fixed-width table.
pub fn render_status(status: &StatusReport) -> String {
    let reports = &status.services;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<8} {:<10} {:<10} {:>10} {}",
        "SERVICE", "PID", "HEALTH", "UPTIME", "MEMORY", "PROCESS"
    );

    for report in reports {
        let pid = report
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".into());
        let health = report.health.as_deref().unwrap_or("unknown");
        let uptime = report.uptime.map(format_uptime).unwrap_or_else(|| "-".into());
        let memory = report
            .memory_bytes
            .map(format_memory)
            .unwrap_or_else(|| "-".into());
        let process = report
            .process
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".into());

        let _ = writeln!(
            out,
            "{:<20} {:<8} {:<10} {:<10} {:>10} {}",
            report.name, pid, health, uptime, memory, process
        );
    }

    if let Some(err) = &status.health_error {
        let _ = writeln!(out, "\nhealth: {err}");
    }

    out
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m{}s", secs / 60, secs % 60),
        _ => format!("{}h{}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn format_memory(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    format!("{:.1} MiB", bytes as f64 / MIB)
}
