#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    REGISTERING_WORKER, Sandbox, fast_timings, sh, wait_for_exit, wait_for_log, wait_until,
};
use orchestrator::{
    config::{ServiceDefinition, Timings},
    constants::ENV_ALLOWLIST,
    env::worker_environment,
    error::OrchestratorError,
    liveness::{SystemProbe, is_alive},
    process::{ProcessStatus, ProcessSupervisor},
};

fn supervisor(sandbox: &Sandbox, timings: Timings) -> ProcessSupervisor {
    ProcessSupervisor::new(sandbox.paths.clone(), Arc::new(SystemProbe), timings)
}

fn start(
    sandbox: &Sandbox,
    supervisor: &ProcessSupervisor,
    name: &str,
    script: &str,
) -> Result<Arc<orchestrator::process::ProcessRecord>, OrchestratorError> {
    let definition = ServiceDefinition::new(name, &sandbox.workdir, &[]);
    let env = worker_environment(&definition, &sandbox.paths)?;
    supervisor.start(name, &sandbox.workdir, &env, &sh(script))
}

#[test]
fn start_register_capture_and_stop() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());

    let record = start(&sandbox, &supervisor, "server", REGISTERING_WORKER).unwrap();
    assert_eq!(record.status(), ProcessStatus::Running);
    assert!(supervisor.wait_for_registration("server", Duration::from_secs(5)));
    assert_eq!(sandbox.registry().read("server").unwrap(), Some(record.pid));

    let log = wait_for_log(&record.log_path, "[stdout] ready");
    assert!(log.lines().all(|line| line.starts_with('[')));

    supervisor.stop("server").unwrap();
    wait_for_exit(record.pid);
    assert_eq!(sandbox.registry().read("server").unwrap(), None);
    assert!(wait_until(Duration::from_secs(5), || {
        record.status() == ProcessStatus::Stopped
    }));
}

#[test]
fn worker_does_not_inherit_controller_environment() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());
    let Some(leaked) = std::env::vars().map(|(key, _)| key).find(|key| {
        !ENV_ALLOWLIST.contains(&key.as_str())
            && !key.starts_with("ORCH_")
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
    }) else {
        return;
    };

    let script = format!(
        r#"echo "service=$ORCH_SERVICE leaked=${{{leaked}:-none}}"; exec sleep 30"#
    );
    let record = start(&sandbox, &supervisor, "rag", &script).unwrap();

    wait_for_log(&record.log_path, "service=rag leaked=none");
    supervisor.stop("rag").unwrap();
    wait_for_exit(record.pid);
}

#[test]
fn stop_force_kills_worker_ignoring_sigterm() {
    let sandbox = Sandbox::new();
    let timings = Timings {
        stop_timeout: Duration::from_millis(500),
        ..fast_timings()
    };
    let supervisor = supervisor(&sandbox, timings);

    let record = start(
        &sandbox,
        &supervisor,
        "stubborn",
        r#"trap '' TERM; echo $$ > "$ORCH_PID_FILE"; while :; do sleep 1; done"#,
    )
    .unwrap();
    assert!(supervisor.wait_for_registration("stubborn", Duration::from_secs(5)));

    let started = Instant::now();
    supervisor.stop("stubborn").unwrap();
    let elapsed = started.elapsed();

    assert!(!is_alive(record.pid));
    assert!(elapsed >= Duration::from_millis(500), "stopped too early: {elapsed:?}");
    assert!(elapsed < timings.stop_timeout + timings.force_kill_wait + Duration::from_secs(1));
    assert_eq!(sandbox.registry().read("stubborn").unwrap(), None);
}

#[test]
fn immediate_crash_fails_start_and_names_log() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());

    let err = start(&sandbox, &supervisor, "broken", "echo boom >&2; exit 3").unwrap_err();
    match &err {
        OrchestratorError::CrashedOnStart { service, log_path } => {
            assert_eq!(service, "broken");
            assert_eq!(log_path, &sandbox.paths.log_file("broken"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("broken.log"));

    wait_for_log(&sandbox.paths.log_file("broken"), "[stderr] boom");
    let record = supervisor.record("broken").unwrap().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        matches!(record.status(), ProcessStatus::ExitedWithError(_))
    }));
}

#[test]
fn missing_workdir_fails_before_launch() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());
    let missing = sandbox.dir.path().join("does-not-exist");

    let err = supervisor
        .start("server", &missing, &Default::default(), &sh("exit 0"))
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::MissingWorkingDirectory { ref path, .. } if path == &missing
    ));
    assert!(!sandbox.paths.log_file("server").exists());
    assert!(supervisor.record("server").unwrap().is_none());
}

#[test]
fn registration_wait_times_out_with_warning_only() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());
    let record = start(&sandbox, &supervisor, "silent", "exec sleep 30").unwrap();

    let started = Instant::now();
    assert!(!supervisor.wait_for_registration("silent", Duration::from_millis(300)));
    assert!(started.elapsed() >= Duration::from_millis(300));

    supervisor.stop("silent").unwrap();
    wait_for_exit(record.pid);
}

#[test]
fn registration_wait_ends_early_when_worker_exits() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());
    start(&sandbox, &supervisor, "short", "sleep 0.5; exit 0").unwrap();

    let started = Instant::now();
    assert!(!supervisor.wait_for_registration("short", Duration::from_secs(10)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        supervisor.record("short").unwrap().unwrap().status(),
        ProcessStatus::ExitedNormally
    );
}

#[test]
fn second_start_in_same_invocation_reuses_live_record() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());

    let first = start(&sandbox, &supervisor, "server", REGISTERING_WORKER).unwrap();
    let second = start(&sandbox, &supervisor, "server", REGISTERING_WORKER).unwrap();
    assert_eq!(first.pid, second.pid);
    assert_eq!(supervisor.tracked().unwrap(), vec!["server"]);

    supervisor.stop("server").unwrap();
    wait_for_exit(first.pid);
}

#[test]
fn orphan_from_previous_invocation_is_stoppable() {
    let sandbox = Sandbox::new();
    let launcher = supervisor(&sandbox, fast_timings());
    let record = start(&sandbox, &launcher, "universal-runtime", REGISTERING_WORKER).unwrap();
    assert!(launcher.wait_for_registration("universal-runtime", Duration::from_secs(5)));

    let later = supervisor(&sandbox, fast_timings());
    assert!(later.record("universal-runtime").unwrap().is_none());
    assert_eq!(later.running_pid("universal-runtime").unwrap(), Some(record.pid));

    later.stop("universal-runtime").unwrap();
    wait_for_exit(record.pid);
    assert_eq!(sandbox.registry().read("universal-runtime").unwrap(), None);
}

#[test]
fn stop_all_sweeps_known_orphans_and_tracked_services() {
    let sandbox = Sandbox::new();
    let launcher = supervisor(&sandbox, fast_timings());
    let orphan = start(&sandbox, &launcher, "rag", REGISTERING_WORKER).unwrap();
    assert!(launcher.wait_for_registration("rag", Duration::from_secs(5)));

    let current = supervisor(&sandbox, fast_timings())
        .with_known_services(vec!["rag".into(), "server".into()]);
    let tracked = start(&sandbox, &current, "scratch", REGISTERING_WORKER).unwrap();

    current.stop_all();

    wait_for_exit(orphan.pid);
    wait_for_exit(tracked.pid);
    assert!(common::registered_services(&sandbox.paths).is_empty());
}

#[test]
fn stopping_an_idle_service_is_a_no_op() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox, fast_timings());
    supervisor.stop("server").unwrap();
}
