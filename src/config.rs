//! Service definitions, the service graph, and configuration loading.
use std::{
    collections::{BTreeMap, btree_map},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    constants::{
        DEFAULT_SERVER_URL, DEFAULT_SERVICE_TIMEOUT, FORCE_KILL_WAIT, HEALTH_POLL_INTERVAL,
        HEALTH_REQUEST_TIMEOUT, LOCK_POLL_INTERVAL, LOCK_TIMEOUT, RAG_SERVICE,
        REGISTRATION_POLL_INTERVAL, REGISTRATION_TIMEOUT, SERVER_SERVICE,
        SERVER_URL_ENV, START_GRACE_PERIOD, STATE_DIR_ENV, STOP_POLL_INTERVAL, STOP_TIMEOUT,
        UNIVERSAL_RUNTIME_SERVICE,
    },
    error::OrchestratorError,
    resolver,
    runtime::RuntimePaths,
};

/// How to launch a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Directory the worker runs in; must exist at launch time.
    pub workdir: PathBuf,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Overlay applied on top of the curated environment. An empty value
    /// means "inherit from the controller if set".
    pub env: BTreeMap<String, String>,
}

/// Static description of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub launch: LaunchSpec,
    /// Component name matched inside the aggregate health payload.
    pub health_component: String,
    /// How long readiness polling may take.
    pub timeout: Duration,
}

impl ServiceDefinition {
    /// Definition with no dependencies, the service name as health component,
    /// and the default readiness timeout.
    pub fn new(name: impl Into<String>, workdir: impl Into<PathBuf>, command: &[&str]) -> Self {
        let name = name.into();
        Self {
            health_component: name.clone(),
            name,
            depends_on: Vec::new(),
            launch: LaunchSpec {
                workdir: workdir.into(),
                command: command.iter().map(|part| part.to_string()).collect(),
                env: BTreeMap::new(),
            },
            timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|dep| dep.to_string()).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.launch.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_health_component(mut self, component: &str) -> Self {
        self.health_component = component.to_string();
        self
    }
}

/// Immutable mapping from service name to definition.
///
/// Passed by value into the manager; tests build their own instead of
/// mutating shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceGraph {
    services: BTreeMap<String, ServiceDefinition>,
}

impl ServiceGraph {
    /// Builds a graph without validating it. The resolver still rejects
    /// cycles and unknown names when asked to order it.
    pub fn from_definitions(definitions: impl IntoIterator<Item = ServiceDefinition>) -> Self {
        Self {
            services: definitions
                .into_iter()
                .map(|definition| (definition.name.clone(), definition))
                .collect(),
        }
    }

    /// Built-in graph: `rag` depends on `server` and `universal-runtime`,
    /// which depend on nothing.
    ///
    /// `universal-runtime` has no edge to `server`, so stopping
    /// `server` cascades to exactly `{server, rag}` and leaves the runtime up.
    ///
    /// Working directories live under `source_root`, which the provisioning
    /// step populates.
    pub fn default_graph(source_root: &Path) -> Self {
        Self::from_definitions([
            ServiceDefinition::new(
                SERVER_SERVICE,
                source_root.join("server"),
                &["uv", "run", "python", "main.py"],
            )
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("HF_TOKEN", "")
            .with_timeout(Duration::from_secs(60)),
            ServiceDefinition::new(
                UNIVERSAL_RUNTIME_SERVICE,
                source_root.join("runtimes").join("universal"),
                &["uv", "run", "python", "server.py"],
            )
            .with_env("PYTHONUNBUFFERED", "1")
            .with_env("HF_TOKEN", "")
            .with_timeout(Duration::from_secs(120)),
            ServiceDefinition::new(
                RAG_SERVICE,
                source_root.join("rag"),
                &["uv", "run", "python", "cli.py", "worker"],
            )
            .depends_on(&[SERVER_SERVICE, UNIVERSAL_RUNTIME_SERVICE])
            .with_env("PYTHONUNBUFFERED", "1")
            .with_timeout(Duration::from_secs(90)),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Service names in lexical order.
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, ServiceDefinition> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Rejects empty commands, unknown dependency references, and cycles.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        for service in self.services.values() {
            if service.launch.command.is_empty() {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "Service '{}' has an empty command",
                    service.name
                )));
            }
            for dep in &service.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(OrchestratorError::InvalidConfig(format!(
                        "Service '{}' declares unknown dependency '{dep}'",
                        service.name
                    )));
                }
            }
        }

        resolver::resolve_many(self, &self.names())?;
        Ok(())
    }
}

/// Bounds for every wait in the supervision path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub registration_timeout: Duration,
    pub registration_poll: Duration,
    pub health_poll: Duration,
    pub health_request_timeout: Duration,
    pub start_grace: Duration,
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
    pub force_kill_wait: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lock_timeout: LOCK_TIMEOUT,
            lock_poll: LOCK_POLL_INTERVAL,
            registration_timeout: REGISTRATION_TIMEOUT,
            registration_poll: REGISTRATION_POLL_INTERVAL,
            health_poll: HEALTH_POLL_INTERVAL,
            health_request_timeout: HEALTH_REQUEST_TIMEOUT,
            start_grace: START_GRACE_PERIOD,
            stop_timeout: STOP_TIMEOUT,
            stop_poll: STOP_POLL_INTERVAL,
            force_kill_wait: FORCE_KILL_WAIT,
        }
    }
}

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: Option<String>,
    /// Base URL of the aggregate health endpoint.
    pub server_url: Option<String>,
    /// Overrides the state directory.
    pub state_dir: Option<String>,
    /// Map of service names to their respective configurations.
    pub services: BTreeMap<String, ServiceConfig>,
    /// Directory relative paths are resolved against; set by the loader.
    #[serde(skip)]
    pub project_dir: Option<PathBuf>,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Working directory; relative paths resolve against the config file.
    pub workdir: Option<String>,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Environment overlay.
    pub env: Option<BTreeMap<String, String>>,
    /// Component name in the health payload; defaults to the service name.
    pub health_component: Option<String>,
    /// Readiness timeout such as `90s` or `2m`.
    pub timeout: Option<String>,
    /// Services that must be healthy first.
    pub depends_on: Option<Vec<String>>,
}

impl Config {
    /// Converts the file representation into a validated [`ServiceGraph`].
    pub fn service_graph(&self) -> Result<ServiceGraph, OrchestratorError> {
        let base = self
            .project_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        let mut definitions = Vec::with_capacity(self.services.len());
        for (name, service) in &self.services {
            let workdir = match service.workdir.as_deref() {
                Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
                Some(dir) => base.join(dir),
                None => base.clone(),
            };
            let timeout = match service.timeout.as_deref() {
                Some(raw) => parse_duration(raw)?,
                None => DEFAULT_SERVICE_TIMEOUT,
            };

            definitions.push(ServiceDefinition {
                name: name.clone(),
                depends_on: service.depends_on.clone().unwrap_or_default(),
                launch: LaunchSpec {
                    workdir,
                    command: service.command.clone(),
                    env: service.env.clone().unwrap_or_default(),
                },
                health_component: service
                    .health_component
                    .clone()
                    .unwrap_or_else(|| name.clone()),
                timeout,
            });
        }

        let graph = ServiceGraph::from_definitions(definitions);
        graph.validate()?;
        Ok(graph)
    }
}

/// Loads and parses the configuration file at `config_path`.
pub fn load_config(config_path: &Path) -> Result<Config, OrchestratorError> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        OrchestratorError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let mut config: Config = serde_yaml::from_str(&content)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    config.project_dir = Some(base_path);
    Ok(config)
}

/// Picks the state directory: the flag, then `ORCH_DATA_DIR`, then the
/// config file, then the default under the home directory.
pub fn resolve_state_dir(flag: Option<&Path>, config: Option<&Config>) -> RuntimePaths {
    if let Some(dir) = flag {
        return RuntimePaths::new(dir);
    }
    if env::var_os(STATE_DIR_ENV).is_some_and(|value| !value.is_empty()) {
        return RuntimePaths::from_env();
    }
    if let Some(config) = config {
        if let Some(dir) = config.state_dir.as_deref().filter(|dir| !dir.is_empty()) {
            let dir = Path::new(dir);
            return match &config.project_dir {
                Some(base) if dir.is_relative() => RuntimePaths::new(base.join(dir)),
                _ => RuntimePaths::new(dir),
            };
        }
    }
    RuntimePaths::from_env()
}

/// Picks the health server URL: the flag, then `ORCH_SERVER_URL`, then the
/// config file, then `http://localhost:8000`.
pub fn resolve_server_url(flag: Option<&str>, config: Option<&Config>) -> String {
    flag.map(str::to_string)
        .or_else(|| env::var(SERVER_URL_ENV).ok().filter(|url| !url.is_empty()))
        .or_else(|| config.and_then(|config| config.server_url.clone()))
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, OrchestratorError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(OrchestratorError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || OrchestratorError::InvalidConfig(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}
