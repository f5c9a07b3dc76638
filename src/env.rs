//! Environment handed to worker processes.
//!
//! Workers get a cleared environment rebuilt from an allow-list of ambient
//! variables, the orchestrator's own variables, and the service overlay.
use std::{collections::BTreeMap, env, sync::OnceLock};

use regex::{Captures, Regex};
use tracing::debug;

use crate::{
    config::ServiceDefinition,
    constants::{ENV_ALLOWLIST, PID_FILE_ENV, SERVICE_NAME_ENV, STATE_DIR_ENV},
    error::OrchestratorError,
    runtime::RuntimePaths,
};

const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)";

fn placeholder_pattern() -> Result<&'static Regex, OrchestratorError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(PLACEHOLDER_PATTERN))
        .as_ref()
        .map_err(|err| {
            OrchestratorError::InvalidConfig(format!("Invalid placeholder pattern: {err}"))
        })
}

/// Expands `${VAR}` and `$VAR` using `lookup`; unknown variables become empty.
pub fn expand_placeholders(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, OrchestratorError> {
    let expanded = placeholder_pattern()?
        .replace_all(input, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_default()
        })
        .into_owned();
    Ok(expanded)
}

/// Builds a worker environment from an explicit ambient lookup.
///
/// An overlay entry with an empty value inherits the controller's value when
/// present and is left unset otherwise; that convention cannot express
/// "deliberately unset" and is kept only for compatibility.
pub fn build_environment(
    definition: &ServiceDefinition,
    paths: &RuntimePaths,
    ambient: impl Fn(&str) -> Option<String>,
) -> Result<BTreeMap<String, String>, OrchestratorError> {
    let mut vars = BTreeMap::new();

    for key in ENV_ALLOWLIST {
        if let Some(value) = ambient(key) {
            vars.insert(key.to_string(), value);
        }
    }

    vars.insert(
        STATE_DIR_ENV.to_string(),
        paths.state_dir().to_string_lossy().into_owned(),
    );
    vars.insert(SERVICE_NAME_ENV.to_string(), definition.name.clone());
    vars.insert(
        PID_FILE_ENV.to_string(),
        paths.pid_file(&definition.name).to_string_lossy().into_owned(),
    );

    for (key, value) in &definition.launch.env {
        if value.is_empty() {
            match ambient(key) {
                Some(inherited) => {
                    vars.insert(key.clone(), inherited);
                }
                None => debug!(
                    "'{}' overlay variable {key} is empty and not set in the controller",
                    definition.name
                ),
            }
        } else {
            vars.insert(key.clone(), expand_placeholders(value, &ambient)?);
        }
    }

    Ok(vars)
}

/// Builds a worker environment from the controller's process environment.
pub fn worker_environment(
    definition: &ServiceDefinition,
    paths: &RuntimePaths,
) -> Result<BTreeMap<String, String>, OrchestratorError> {
    build_environment(definition, paths, |key| env::var(key).ok())
}
