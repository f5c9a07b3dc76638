//! Per-invocation process supervision and graceful-then-forced shutdown.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, io,
    path::{Path, PathBuf},
    process::{self, Child, Command, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::{
    config::Timings,
    constants::{CRASH_LOG_TAIL_LINES, LOG_DRAIN_TIMEOUT},
    error::{OrchestratorError, PidFileError},
    liveness::LivenessProbe,
    logs::{self, LogStream, LogWriter},
    pid::{PidRegistry, RegistryState},
    runtime::RuntimePaths,
    signal,
};

/// Lifecycle of a process launched by this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Launching,
    Running,
    ExitedNormally,
    ExitedWithError(String),
    Stopped,
}

impl ProcessStatus {
    /// Terminal states never change again within an invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::ExitedNormally
                | ProcessStatus::ExitedWithError(_)
                | ProcessStatus::Stopped
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Launching => write!(f, "launching"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::ExitedNormally => write!(f, "exited normally"),
            ProcessStatus::ExitedWithError(detail) => write!(f, "exited with error: {detail}"),
            ProcessStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// How worker output reaches the service log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogCapture {
    /// Reader threads inside this process. Capture ends with the invocation.
    #[default]
    Threads,
    /// Detached `<program> relay` processes that outlive the invocation.
    Relay { program: PathBuf },
}

/// Capture attached to one running worker.
enum Capture {
    Threads(Vec<JoinHandle<()>>),
    Relays(Vec<Child>),
}

impl Capture {
    /// Bounded wait for buffered output to reach the log.
    fn drain(self, timeout: Duration) -> bool {
        match self {
            Capture::Threads(readers) => logs::join_readers(readers, timeout),
            Capture::Relays(relays) => logs::wait_relays(relays, timeout),
        }
    }
}

/// What this invocation knows about one process it launched.
#[derive(Debug)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Local>,
    pub log_path: PathBuf,
    status: Mutex<ProcessStatus>,
    stop_requested: AtomicBool,
}

impl ProcessRecord {
    fn new(name: &str, pid: u32, log_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            pid,
            started_at: Local::now(),
            log_path,
            status: Mutex::new(ProcessStatus::Launching),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Moves to `next` unless a terminal state was already reached.
    /// Returns whether the transition happened.
    fn transition(&self, next: ProcessStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.is_terminal() {
            return false;
        }
        *status = next;
        true
    }

    pub fn has_exited(&self) -> bool {
        self.status().is_terminal()
    }

    /// Polls until a terminal state is recorded or `timeout` passes.
    fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
        true
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Launches and stops worker processes for one tool invocation.
///
/// In-memory records die with the invocation; the PID registry is what lets
/// a later invocation find and stop the same workers.
pub struct ProcessSupervisor {
    paths: RuntimePaths,
    registry: PidRegistry,
    probe: Arc<dyn LivenessProbe>,
    timings: Timings,
    log_capture: LogCapture,
    known_services: Vec<String>,
    records: Mutex<HashMap<String, Arc<ProcessRecord>>>,
}

impl ProcessSupervisor {
    pub fn new(paths: RuntimePaths, probe: Arc<dyn LivenessProbe>, timings: Timings) -> Self {
        Self {
            registry: PidRegistry::new(paths.clone()),
            paths,
            probe,
            timings,
            log_capture: LogCapture::default(),
            known_services: Vec::new(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Services probed through the registry by [`stop_all`](Self::stop_all),
    /// in the order they should be stopped.
    pub fn with_known_services(mut self, names: Vec<String>) -> Self {
        self.known_services = names;
        self
    }

    pub fn with_log_capture(mut self, capture: LogCapture) -> Self {
        self.log_capture = capture;
        self
    }

    pub fn log_capture(&self) -> &LogCapture {
        &self.log_capture
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    pub fn record(&self, name: &str) -> Result<Option<Arc<ProcessRecord>>, OrchestratorError> {
        Ok(self.records.lock()?.get(name).cloned())
    }

    /// Names of every service launched by this invocation.
    pub fn tracked(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut names: Vec<String> = self.records.lock()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Removes a stale registry entry and reports whether a live foreign
    /// process already serves `name`.
    pub fn check_existing(&self, name: &str) -> Result<RegistryState, OrchestratorError> {
        Ok(self.registry.clear_stale(name, self.probe.as_ref())?)
    }

    /// The live PID serving `name`, preferring this invocation's own child.
    pub fn running_pid(&self, name: &str) -> Result<Option<u32>, OrchestratorError> {
        if let Some(record) = self.record(name)? {
            if !record.has_exited() && self.probe.is_alive(record.pid) {
                return Ok(Some(record.pid));
            }
        }
        Ok(self.registered_pid(name))
    }

    /// Launches `argv` in `workdir` with exactly `env`, capturing output into
    /// the service log.
    ///
    /// Fails with [`OrchestratorError::CrashedOnStart`] when the worker dies
    /// within the start grace period.
    pub fn start(
        &self,
        name: &str,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        argv: &[String],
    ) -> Result<Arc<ProcessRecord>, OrchestratorError> {
        if let Some(existing) = self.record(name)? {
            if !existing.has_exited() && self.probe.is_alive(existing.pid) {
                info!(
                    "Service '{name}' already launched by this invocation (PID {})",
                    existing.pid
                );
                return Ok(existing);
            }
        }

        let Some((program, args)) = argv.split_first() else {
            return Err(OrchestratorError::InvalidConfig(format!(
                "service '{name}' has an empty command"
            )));
        };

        if !workdir.is_dir() {
            return Err(OrchestratorError::MissingWorkingDirectory {
                service: name.to_string(),
                path: workdir.to_path_buf(),
            });
        }

        let start_error = |source: io::Error| OrchestratorError::ServiceStartError {
            service: name.to_string(),
            source,
        };

        let log_path = self.paths.log_file(name);
        logs::open_log(&log_path).map_err(start_error)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(workdir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        signal::configure(&mut command);

        debug!("Launching '{name}': {} in {}", argv.join(" "), workdir.display());
        let mut child = command.spawn().map_err(start_error)?;
        let pid = child.id();
        let record = Arc::new(ProcessRecord::new(name, pid, log_path.clone()));

        let capture = match self.attach_capture(name, &mut child, &log_path) {
            Ok(capture) => capture,
            Err(err) => {
                warn!("Could not capture output of '{name}' (PID {pid}); killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(start_error(err));
            }
        };

        let waiter_record = Arc::clone(&record);
        thread::Builder::new()
            .name(format!("{name}-wait"))
            .spawn(move || {
                let outcome = child.wait();
                if !capture.drain(LOG_DRAIN_TIMEOUT) {
                    debug!(
                        "Output of '{}' still open after exit; detaching log capture",
                        waiter_record.name
                    );
                }
                record_exit(&waiter_record, outcome);
            })
            .map_err(start_error)?;

        self.records
            .lock()?
            .insert(name.to_string(), Arc::clone(&record));
        info!("Started service '{name}' (PID {pid}); logging to {}", log_path.display());

        thread::sleep(self.timings.start_grace);
        if record.has_exited() || !self.probe.is_alive(pid) {
            // Let the crash output land before pointing the operator at it.
            record.wait_exited(LOG_DRAIN_TIMEOUT + self.timings.stop_poll);
            return Err(OrchestratorError::CrashedOnStart {
                service: name.to_string(),
                log_path,
            });
        }
        record.transition(ProcessStatus::Running);

        Ok(record)
    }

    /// Hands the worker's stdout and stderr to the configured capture.
    fn attach_capture(
        &self,
        name: &str,
        child: &mut Child,
        log_path: &Path,
    ) -> io::Result<Capture> {
        match &self.log_capture {
            LogCapture::Threads => {
                let mut readers = Vec::new();
                if let Some(stdout) = child.stdout.take() {
                    let writer = LogWriter::open(log_path, LogStream::Stdout)?;
                    readers.push(logs::spawn_log_writer(name, stdout, writer)?);
                }
                if let Some(stderr) = child.stderr.take() {
                    let writer = LogWriter::open(log_path, LogStream::Stderr)?;
                    readers.push(logs::spawn_log_writer(name, stderr, writer)?);
                }
                Ok(Capture::Threads(readers))
            }
            LogCapture::Relay { program } => {
                let mut relays = Vec::new();
                if let Some(stdout) = child.stdout.take() {
                    let input = Stdio::from(stdout);
                    let relay =
                        logs::spawn_relay(program, name, LogStream::Stdout, log_path, input)?;
                    relays.push(relay);
                }
                if let Some(stderr) = child.stderr.take() {
                    let input = Stdio::from(stderr);
                    let relay =
                        logs::spawn_relay(program, name, LogStream::Stderr, log_path, input)?;
                    relays.push(relay);
                }
                Ok(Capture::Relays(relays))
            }
        }
    }

    /// Waits for the worker to write its PID file. A timeout is only a
    /// warning because the worker may still be initialising.
    pub fn wait_for_registration(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pid) = self.registered_pid(name) {
                debug!("Service '{name}' registered as PID {pid}");
                return true;
            }

            if let Ok(Some(record)) = self.record(name) {
                if record.has_exited() {
                    warn!(
                        "Service '{name}' exited ({}) before registering its PID",
                        record.status()
                    );
                    return false;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Service '{name}' did not register a PID within {timeout:?}; continuing");
                return false;
            }
            thread::sleep(self.timings.registration_poll.min(deadline - now));
        }
    }

    /// Stops `name` whether it was launched here or by an earlier invocation.
    ///
    /// Processes this invocation did not launch are only ever polled, never
    /// waited on.
    pub fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        let tracked = self.record(name)?;
        let mut targets = BTreeSet::new();

        if let Some(record) = &tracked {
            if !record.has_exited() {
                record.request_stop();
                targets.insert(record.pid);
            }
        }
        if let Some(pid) = self.registered_pid(name) {
            targets.insert(pid);
        }
        if targets.remove(&process::id()) {
            warn!("Refusing to signal our own process while stopping '{name}'");
        }

        if targets.is_empty() {
            debug!("Service '{name}' is not running");
            if let Err(err) = self.check_existing(name) {
                warn!("Failed to clean up PID file for '{name}': {err}");
            }
            if let Some(record) = &tracked {
                record.transition(ProcessStatus::Stopped);
            }
            return Ok(());
        }

        info!("Stopping service '{name}' (PID {})", join_pids(&targets));

        let mut graceful = true;
        for pid in &targets {
            if let Err(err) = signal::terminate(*pid, name) {
                warn!("Failed to send SIGTERM to '{name}' (PID {pid}): {err}; force killing");
                graceful = false;
            }
        }

        let exited = graceful && self.wait_until_dead(&targets, self.timings.stop_timeout);
        if !exited {
            if graceful {
                warn!("Service '{name}' did not exit after SIGTERM; sending SIGKILL");
            }
            let mut kill_error = None;
            for pid in &targets {
                if let Err(err) = signal::force_kill(*pid, name) {
                    warn!("Failed to send SIGKILL to '{name}' (PID {pid}): {err}");
                    kill_error.get_or_insert(err);
                }
            }

            if !self.wait_until_dead(&targets, self.timings.force_kill_wait) {
                let source = kill_error.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("PID {} still alive after SIGKILL", join_pids(&targets)),
                    )
                });
                return Err(OrchestratorError::ServiceStopError {
                    service: name.to_string(),
                    source,
                });
            }
        }

        if let Err(err) = self.registry.remove(name) {
            warn!("Failed to remove PID file for '{name}': {err}");
        }
        if let Some(record) = &tracked {
            record.transition(ProcessStatus::Stopped);
        }
        info!("Service '{name}' stopped");
        Ok(())
    }

    /// Best-effort stop of every tracked service and every known service
    /// with a live registry entry. Failures are logged.
    pub fn stop_all(&self) {
        let mut names = match self.tracked() {
            Ok(names) => names,
            Err(err) => {
                error!("Failed to list tracked services: {err}");
                Vec::new()
            }
        };
        names.retain(|name| !self.known_services.contains(name));
        names.extend(self.known_services.iter().cloned());

        for name in names {
            if let Err(err) = self.stop(&name) {
                error!("Failed to stop service '{name}': {err}");
            }
        }
    }

    fn registered_pid(&self, name: &str) -> Option<u32> {
        match self.registry.live_pid(name, self.probe.as_ref()) {
            Ok(pid) => pid,
            // A worker may be caught mid-write; treat it as not yet registered.
            Err(PidFileError::Parse { .. }) => None,
            Err(err) => {
                warn!("Failed to read PID file for '{name}': {err}");
                None
            }
        }
    }

    fn wait_until_dead(&self, pids: &BTreeSet<u32>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pids.iter().all(|pid| !self.probe.is_alive(*pid)) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.timings.stop_poll.min(deadline - now));
        }
    }
}

fn record_exit(record: &ProcessRecord, outcome: io::Result<process::ExitStatus>) {
    let name = &record.name;
    let next = match outcome {
        _ if record.stop_requested() => ProcessStatus::Stopped,
        Ok(status) if status.success() => ProcessStatus::ExitedNormally,
        Ok(status) => ProcessStatus::ExitedWithError(status.to_string()),
        Err(err) => ProcessStatus::ExitedWithError(err.to_string()),
    };

    if !record.transition(next.clone()) {
        return;
    }

    match next {
        ProcessStatus::ExitedWithError(detail) => {
            error!("Service '{name}' exited with error: {detail}");
            match logs::tail_lines(&record.log_path, CRASH_LOG_TAIL_LINES) {
                Ok(lines) => {
                    for line in lines {
                        error!("[{name}] {line}");
                    }
                }
                Err(err) => warn!("Could not read log for '{name}': {err}"),
            }
        }
        ProcessStatus::ExitedNormally => info!("Service '{name}' exited normally"),
        _ => debug!("Service '{name}' exited after stop request"),
    }
}

fn join_pids(pids: &BTreeSet<u32>) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
