use advisory_orchestrator::{
    agent::{Collaborators, Orchestrator},
    api::start_server,
    config::Settings,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Loads .env as well
    let settings = Settings::from_env()?;

    info!("Advisory Orchestrator - API Server");
    info!("Port: {}", settings.port);
    info!(
        max_steps = settings.orchestrator.max_steps,
        retry_limit = settings.orchestrator.retry_limit,
        "Limits"
    );

    let collaborators = Collaborators::from_settings(&settings)?;
    let orchestrator = Arc::new(Orchestrator::new(settings.orchestrator.clone(), collaborators)?);

    info!("Orchestrator initialized");

    start_server(orchestrator, settings.port).await?;

    Ok(())
}
