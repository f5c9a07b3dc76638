#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{fs, process, sync::Arc};

use common::{Sandbox, dead_pid, fast_timings};
use orchestrator::{
    liveness::SystemProbe,
    pid::RegistryState,
    process::ProcessSupervisor,
};

fn supervisor(sandbox: &Sandbox) -> ProcessSupervisor {
    ProcessSupervisor::new(sandbox.paths.clone(), Arc::new(SystemProbe), fast_timings())
}

#[test]
fn stale_pid_file_is_removed_before_launch() {
    let sandbox = Sandbox::new();
    let pid = dead_pid();
    fs::write(sandbox.paths.pid_file("server"), format!("{pid}\n")).unwrap();

    let state = supervisor(&sandbox).check_existing("server").unwrap();

    assert_eq!(state, RegistryState::ClearedStale(pid));
    assert!(!sandbox.paths.pid_file("server").exists());
}

#[test]
fn live_pid_file_is_never_removed() {
    let sandbox = Sandbox::new();
    let own = process::id();
    fs::write(sandbox.paths.pid_file("server"), own.to_string()).unwrap();

    let supervisor = supervisor(&sandbox);
    assert_eq!(
        supervisor.check_existing("server").unwrap(),
        RegistryState::Live(own)
    );
    assert_eq!(supervisor.running_pid("server").unwrap(), Some(own));
    assert!(sandbox.paths.pid_file("server").exists());
}

#[test]
fn stop_never_signals_the_controller_itself() {
    let sandbox = Sandbox::new();
    let own = process::id();
    fs::write(sandbox.paths.pid_file("rag"), own.to_string()).unwrap();

    supervisor(&sandbox).stop("rag").unwrap();

    assert_eq!(sandbox.registry().read("rag").unwrap(), Some(own));
}

#[test]
fn unreadable_pid_file_is_cleared() {
    let sandbox = Sandbox::new();
    fs::write(sandbox.paths.pid_file("rag"), "not-a-pid").unwrap();

    assert_eq!(
        supervisor(&sandbox).check_existing("rag").unwrap(),
        RegistryState::Absent
    );
    assert!(!sandbox.paths.pid_file("rag").exists());
}

#[test]
fn missing_pid_file_is_absent() {
    let sandbox = Sandbox::new();
    let supervisor = supervisor(&sandbox);
    assert_eq!(
        supervisor.check_existing("universal-runtime").unwrap(),
        RegistryState::Absent
    );
    assert_eq!(supervisor.running_pid("universal-runtime").unwrap(), None);
}

#[test]
fn stopping_a_stale_entry_cleans_it_up() {
    let sandbox = Sandbox::new();
    fs::write(sandbox.paths.pid_file("server"), dead_pid().to_string()).unwrap();

    supervisor(&sandbox).stop("server").unwrap();

    assert!(!sandbox.paths.pid_file("server").exists());
}
