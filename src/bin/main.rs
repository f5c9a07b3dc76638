use std::{
    env,
    error::Error,
    io,
    path::{Path, PathBuf},
    sync::mpsc,
};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use orchestrator::{
    cli::{Cli, Commands, parse_args},
    config::{
        Config, ServiceGraph, Timings, load_config, resolve_server_url, resolve_state_dir,
    },
    health::HttpHealthClient,
    logs::{relay_stream, show_logs},
    manager::{ServiceManager, render_status},
    process::LogCapture,
    runtime::RuntimePaths,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    if let Commands::Relay { service, stream, log } = &args.command {
        relay_stream(io::stdin().lock(), *stream, log)
            .map_err(|err| format!("Log relay for '{service}' ({stream}) failed: {err}"))?;
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Some(load_config(&resolve_config_path(path)?)?),
        None => None,
    };
    let graph = match &config {
        Some(config) => config.service_graph()?,
        None => ServiceGraph::default_graph(&env::current_dir()?),
    };
    let paths = resolve_state_dir(args.state_dir.as_deref(), config.as_ref());

    let manager = build_manager(&args, config.as_ref(), graph, paths)?
        .with_log_capture(LogCapture::Relay { program: env::current_exe()? });

    match args.command {
        Commands::Start { services } => {
            let targets = targets_or_all(&manager, services);
            manager.ensure(&targets)?;
            info!("All requested services are healthy");
        }
        Commands::Run { services } => {
            let targets = targets_or_all(&manager, services);
            run_foreground(&manager, &targets)?;
        }
        Commands::Stop { services } => {
            if services.is_empty() {
                manager.stop_all();
            } else {
                manager.stop(&services)?;
            }
        }
        Commands::Status => {
            let status = manager.status()?;
            print!("{}", render_status(&status));
        }
        Commands::Logs { service, lines } => {
            if !manager.graph().contains(&service) {
                return Err(format!("Unknown service '{service}'").into());
            }
            show_logs(&service, &manager.paths().log_file(&service), lines)?;
        }
        Commands::Relay { .. } => {}
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn build_manager(
    args: &Cli,
    config: Option<&Config>,
    graph: ServiceGraph,
    paths: RuntimePaths,
) -> Result<ServiceManager, Box<dyn Error>> {
    let timings = Timings::default();
    let server_url = resolve_server_url(args.server_url.as_deref(), config);
    let health = HttpHealthClient::new(&server_url, timings.health_request_timeout)?;
    info!(
        "Using state directory {} and health endpoint {}",
        paths.state_dir().display(),
        health.url()
    );

    Ok(ServiceManager::new(graph, paths, timings, Box::new(health))?)
}

fn targets_or_all(manager: &ServiceManager, services: Vec<String>) -> Vec<String> {
    if services.is_empty() {
        manager.graph().names()
    } else {
        services
    }
}

/// Ensures `targets`, then blocks until Ctrl-C and stops everything.
fn run_foreground(manager: &ServiceManager, targets: &[String]) -> Result<(), Box<dyn Error>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    if let Err(err) = manager.ensure(targets) {
        warn!("Startup failed; stopping services launched so far");
        manager.stop_all();
        return Err(err.into());
    }

    info!("Services running; press Ctrl-C to stop");
    let _ = rx.recv();
    info!("Interrupt received; stopping services");
    manager.stop_all();
    Ok(())
}

fn resolve_config_path(path: &Path) -> Result<PathBuf, Box<dyn Error>> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let resolved = env::current_dir()?.join(path);
    Ok(resolved.canonicalize().unwrap_or(resolved))
}
