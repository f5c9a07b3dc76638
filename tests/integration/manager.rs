#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{fs, process, sync::atomic::Ordering, time::Duration};

use common::{
    RegistryHealth, Sandbox, ScriptedHealth, fast_timings, registered_services, wait_for_exit,
};
use orchestrator::{
    config::{ServiceDefinition, ServiceGraph},
    error::{HealthError, OrchestratorError, ResolveError},
    health::HealthSource,
    manager::ServiceManager,
};

/// Worker that records when it launches and when it is asked to stop.
fn recording_worker(name: &str) -> String {
    format!(
        r#"echo {name} >> "$ORCH_DATA_DIR/launch-order"
trap 'echo {name} >> "$ORCH_DATA_DIR/stop-order"; exit 0' TERM
echo $$ > "$ORCH_PID_FILE"
while :; do sleep 0.1; done"#
    )
}

fn service(sandbox: &Sandbox, name: &str, deps: &[&str]) -> ServiceDefinition {
    let script = recording_worker(name);
    ServiceDefinition::new(name, &sandbox.workdir, &["sh", "-c", script.as_str()])
        .depends_on(deps)
        .with_timeout(Duration::from_secs(10))
}

fn chain(sandbox: &Sandbox) -> ServiceGraph {
    ServiceGraph::from_definitions([
        service(sandbox, "db", &[]),
        service(sandbox, "api", &["db"]),
        service(sandbox, "web", &["api"]),
        service(sandbox, "cache", &[]),
    ])
}

fn manager(
    sandbox: &Sandbox,
    graph: ServiceGraph,
    health: impl HealthSource + 'static,
) -> ServiceManager {
    ServiceManager::new(graph, sandbox.paths.clone(), fast_timings(), Box::new(health)).unwrap()
}

fn registry_health(sandbox: &Sandbox) -> RegistryHealth {
    RegistryHealth::new(&sandbox.paths, &["db", "api", "web", "cache"])
}

#[test]
fn ensure_nothing_is_a_no_op() {
    let sandbox = Sandbox::without_state();
    let health = ScriptedHealth::new(&[]);
    let checks = health.checks.clone();
    let manager = manager(&sandbox, chain(&sandbox), health);

    let names: [&str; 0] = [];
    manager.ensure(&names).unwrap();
    manager.stop(&names).unwrap();

    assert_eq!(checks.load(Ordering::SeqCst), 0);
    assert!(!sandbox.paths.state_dir().exists());
}

#[test]
fn ensure_unknown_service_fails_without_side_effects() {
    let sandbox = Sandbox::without_state();
    let health = ScriptedHealth::new(&[]);
    let checks = health.checks.clone();
    let manager = manager(&sandbox, chain(&sandbox), health);

    let err = manager.ensure(&["db", "unknown-x"]).unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Resolve(ResolveError::UnknownService(ref name)) if name == "unknown-x"
    ));
    assert_eq!(checks.load(Ordering::SeqCst), 0);
    assert!(!sandbox.paths.state_dir().exists());
}

#[test]
fn ensure_starts_dependencies_first_and_stop_cascades_to_dependents() {
    let sandbox = Sandbox::new();
    let manager = manager(&sandbox, chain(&sandbox), registry_health(&sandbox));

    manager.ensure(&["web"]).unwrap();
    assert_eq!(sandbox.read_lines("launch-order"), vec!["db", "api", "web"]);

    let pids: Vec<u32> = ["db", "api", "web"]
        .iter()
        .map(|name| sandbox.registry().read(name).unwrap().unwrap())
        .collect();

    manager.stop(&["db"]).unwrap();
    assert_eq!(sandbox.read_lines("stop-order"), vec!["web", "api", "db"]);
    for pid in pids {
        wait_for_exit(pid);
    }
    assert!(registered_services(&sandbox.paths).is_empty());
}

#[test]
fn ensure_many_merges_orders_without_relaunching() {
    let sandbox = Sandbox::new();
    let manager = manager(&sandbox, chain(&sandbox), registry_health(&sandbox));

    manager.ensure(&["api", "cache", "web", "db"]).unwrap();
    assert_eq!(
        sandbox.read_lines("launch-order"),
        vec!["db", "api", "cache", "web"]
    );

    manager.ensure(&["web"]).unwrap();
    assert_eq!(sandbox.read_lines("launch-order").len(), 4);

    manager.stop_all();
    assert!(registered_services(&sandbox.paths).is_empty());
}

#[test]
fn already_healthy_services_are_not_launched() {
    let sandbox = Sandbox::new();
    let health = ScriptedHealth::new(&[("db", "HEALTHY"), ("api", "healthy")]);
    let manager = manager(&sandbox, chain(&sandbox), health);

    manager.ensure(&["api"]).unwrap();

    assert!(sandbox.read_lines("launch-order").is_empty());
    assert!(!sandbox.paths.log_file("db").exists());
}

#[test]
fn live_foreign_instance_is_reused_under_the_lock() {
    let sandbox = Sandbox::new();
    fs::write(sandbox.paths.pid_file("cache"), process::id().to_string()).unwrap();
    let health = ScriptedHealth::new(&[("cache", "unhealthy")]).healthy_after(2);
    let manager = manager(&sandbox, chain(&sandbox), health);

    manager.ensure(&["cache"]).unwrap();

    assert!(sandbox.read_lines("launch-order").is_empty());
    assert!(sandbox.paths.pid_file("cache").exists());
}

#[test]
fn stale_registration_does_not_block_launch() {
    let sandbox = Sandbox::new();
    fs::write(sandbox.paths.pid_file("cache"), common::dead_pid().to_string()).unwrap();
    let manager = manager(&sandbox, chain(&sandbox), registry_health(&sandbox));

    manager.ensure(&["cache"]).unwrap();
    assert_eq!(sandbox.read_lines("launch-order"), vec!["cache"]);

    manager.stop(&["cache"]).unwrap();
    assert!(!sandbox.paths.pid_file("cache").exists());
}

#[test]
fn health_timeout_reports_service_and_last_payload() {
    let sandbox = Sandbox::new();
    let graph = ServiceGraph::from_definitions([
        service(&sandbox, "db", &[]).with_timeout(Duration::from_millis(400)),
        service(&sandbox, "api", &["db"]),
    ]);
    let health = ScriptedHealth::new(&[("db", "unhealthy"), ("api", "unhealthy")]);
    let manager = manager(&sandbox, graph, health);

    let err = manager.ensure(&["api"]).unwrap_err();

    match &err {
        OrchestratorError::HealthTimeout {
            service,
            timeout,
            last_error,
        } => {
            assert_eq!(service, "db");
            assert_eq!(*timeout, Duration::from_millis(400));
            assert!(matches!(last_error, HealthError::ComponentUnhealthy { .. }));
            let payload = last_error.payload().expect("payload is attached");
            assert!(!payload.component_healthy("db"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(sandbox.read_lines("launch-order"), vec!["db"]);

    manager.stop_all();
    assert!(registered_services(&sandbox.paths).is_empty());
}

#[test]
fn crashing_dependency_aborts_the_batch() {
    let sandbox = Sandbox::new();
    let graph = ServiceGraph::from_definitions([
        ServiceDefinition::new("db", &sandbox.workdir, &["sh", "-c", "echo corrupt >&2; exit 1"]),
        service(&sandbox, "api", &["db"]),
    ]);
    let manager = manager(&sandbox, graph, RegistryHealth::new(&sandbox.paths, &["db", "api"]));

    let err = manager.ensure(&["api"]).unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::CrashedOnStart { ref service, .. } if service == "db"
    ));
    assert!(!sandbox.paths.log_file("api").exists());
}

#[test]
fn stopping_a_leaf_leaves_dependencies_running() {
    let sandbox = Sandbox::new();
    let manager = manager(&sandbox, chain(&sandbox), registry_health(&sandbox));
    manager.ensure(&["api"]).unwrap();

    manager.stop(&["api"]).unwrap();

    assert_eq!(sandbox.read_lines("stop-order"), vec!["api"]);
    assert_eq!(
        registered_services(&sandbox.paths),
        ["db".to_string()].into_iter().collect()
    );

    manager.stop_all();
}

#[test]
fn status_reports_every_service() {
    let sandbox = Sandbox::new();
    let manager = manager(&sandbox, chain(&sandbox), registry_health(&sandbox));
    manager.ensure(&["db"]).unwrap();

    let status = manager.status().unwrap();

    assert_eq!(status.services.len(), 4);
    let db = status.services.iter().find(|report| report.name == "db").unwrap();
    assert!(db.pid.is_some());
    assert_eq!(db.health.as_deref(), Some("healthy"));
    let web = status.services.iter().find(|report| report.name == "web").unwrap();
    assert_eq!(web.pid, None);
    assert_eq!(web.health.as_deref(), Some("unhealthy"));
    assert!(status.health_error.is_some());

    manager.stop_all();
}

#[test]
fn invalid_graph_is_rejected_at_construction() {
    let sandbox = Sandbox::new();
    let graph = ServiceGraph::from_definitions([
        service(&sandbox, "a", &["b"]),
        service(&sandbox, "b", &["a"]),
    ]);

    let result = ServiceManager::new(
        graph,
        sandbox.paths.clone(),
        fast_timings(),
        Box::new(ScriptedHealth::new(&[])),
    );

    assert!(matches!(
        result,
        Err(OrchestratorError::Resolve(ResolveError::Cycle(_)))
    ));
}
