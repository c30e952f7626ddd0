use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use polychat::orchestrator::{DefaultDriverFactory, Orchestrator};
use polychat::{config, EventBus};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file if it exists
    let env_file_path = match dotenvy::dotenv() {
        Ok(path) => Some(path),
        Err(_) => None,
    };

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level if RUST_LOG is not set
            if cfg!(debug_assertions) {
                "polychat=debug,warn".into()
            } else {
                "polychat=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!(version = polychat::VERSION, "polychat starting");

    // Log environment loading after logger is initialized
    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let config = match config::load_config().await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration is invalid");
        return ExitCode::from(2);
    }
    if config.enabled_platforms().is_empty() {
        error!("No platforms are enabled; nothing to do");
        return ExitCode::from(2);
    }

    let bus = EventBus::new(config.event_bus.capacity);
    let factory = match DefaultDriverFactory::new(config.clone()) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!(error = %e, "Failed to set up platform drivers");
            return ExitCode::from(1);
        }
    };

    let orchestrator = Orchestrator::new(config, bus, factory);
    if let Err(e) = orchestrator.start().await {
        error!(error = %e, "Failed to start platform connections");
        return ExitCode::from(1);
    }

    info!("polychat started");
    info!("Press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    orchestrator.shutdown().await;

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
