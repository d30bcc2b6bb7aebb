//! Worker agent command.

use anyhow::{Context, Result, bail};
use buildit_config::{EnvironmentConfig, load_system_config};
use buildit_core::executor::BuildEnvironment;
use buildit_db::StoreSettings;
use buildit_executor::{DockerEnvironment, ProcessEnvironment};
use buildit_scheduler::{AgentConfig, WorkerAgent, install_shutdown_handler};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn build_environment(config: &EnvironmentConfig) -> Result<Arc<dyn BuildEnvironment>> {
    Ok(match config {
        EnvironmentConfig::Process { command, workdir } => {
            let mut env = ProcessEnvironment::new(command.clone())
                .context("Invalid build command")?;
            if let Some(workdir) = workdir {
                env = env.with_workdir(workdir);
            }
            Arc::new(env)
        }
        EnvironmentConfig::Docker { image, command } => Arc::new(
            DockerEnvironment::new(image.clone(), command.clone())
                .context("Failed to connect to Docker")?,
        ),
    })
}

/// Read the host name when neither the config nor the environment gives one.
fn system_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Run a worker agent until SIGINT or SIGTERM.
pub async fn run(
    config_path: &Path,
    target: Option<String>,
    hostname: Option<String>,
) -> Result<()> {
    let mut config = load_system_config(config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    config.apply_env();

    let Some(worker) = config.worker.clone() else {
        bail!("No worker section in {}", config_path.display());
    };
    let Some(store_url) = config.store_url.clone() else {
        bail!("Workers need a shared store; set `store` or BUILDIT_DATABASE_URL");
    };

    let target = config
        .targets
        .resolve(target.as_deref().unwrap_or(&worker.target))?;
    let hostname = hostname
        .or_else(|| worker.hostname.clone())
        .unwrap_or_else(system_hostname);
    let environment = build_environment(&worker.environment)?;

    let settings = StoreSettings::new(config.targets.clone(), config.lease.max_attempts);
    let (store, queue) = buildit_db::connect(&store_url, settings)
        .await
        .context("Failed to open job store")?;

    let agent = WorkerAgent::new(
        hostname,
        target,
        store,
        queue,
        environment,
        AgentConfig {
            lease: config.lease.duration,
            heartbeat: config.lease.heartbeat,
            build_timeout: config.build.timeout,
            ..Default::default()
        },
    );
    info!(
        worker_id = %agent.id(),
        environment = environment_name(&worker.environment),
        "Worker ready"
    );

    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await;
    Ok(())
}

fn environment_name(config: &EnvironmentConfig) -> &'static str {
    match config {
        EnvironmentConfig::Process { .. } => "process",
        EnvironmentConfig::Docker { .. } => "docker",
    }
}
