use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use plato_sandbox::controller::SandboxController;
use plato_sandbox::{hub, Config};

/// Hosts the session registry for the interactive surface. The process stays
/// up until interrupted; the exit hook closes every registered session so no
/// sandbox, tunnel or SSH alias is leaked.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let controller = Arc::new(SandboxController::from_config(config));

    match hub::list_simulators(controller.api()).await {
        Ok(simulators) => {
            tracing::info!(count = simulators.len(), "simulator catalog reachable");
        }
        Err(err) => {
            tracing::warn!(?err, "simulator catalog not reachable; remote operations may fail");
        }
    }

    tracing::info!("session host running; press ctrl-c to close all sessions and exit");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down; closing registered sessions");
    controller.shutdown().await;
    Ok(())
}
